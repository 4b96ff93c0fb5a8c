//! The field catalog: every telemetry field the probe can capture, with its
//! kernel data source, C width and decode semantics. The catalog is the
//! single source of truth shared by the code generator and the decoder; the
//! two must agree on member order and widths or the on-wire layout breaks.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::config::ConfigError;

/// C storage type of a catalog field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CType {
    U8,
    U16,
    U32,
    U64,
    U128,
    /// `char[TASK_COMM_LEN]`, 16 bytes null-padded.
    Char,
}

impl CType {
    pub fn c_name(self) -> &'static str {
        match self {
            CType::U8 => "u8",
            CType::U16 => "u16",
            CType::U32 => "u32",
            CType::U64 => "u64",
            CType::U128 => "unsigned __int128",
            CType::Char => "char",
        }
    }

    /// Width in bytes on the wire.
    pub fn width(self) -> usize {
        match self {
            CType::U8 => 1,
            CType::U16 => 2,
            CType::U32 => 4,
            CType::U64 => 8,
            CType::U128 | CType::Char => 16,
        }
    }

    /// C alignment of the member. A `char[16]` array is byte-aligned even
    /// though it is 16 bytes wide; `__int128` really is 16-aligned.
    pub fn align(self) -> usize {
        match self {
            CType::Char => 1,
            other => other.width(),
        }
    }
}

/// Semantic type: how the decoder renders the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    Scalar,
    Ip,
}

/// One catalog entry.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    /// Kernel struct member (or generated member) name.
    pub cfield: &'static str,
    pub ctype: CType,
    pub dtype: DType,
    /// C data source expression: a struct path or a bpf helper name.
    pub ds: &'static str,
    /// Source is accessed with `.` instead of `->`.
    pub dsnp: bool,
    /// Source is network byte order.
    pub big_endian: bool,
    /// Default math suffix appended to the source expression.
    pub math: Option<&'static str>,
}

impl FieldSpec {
    fn new(cfield: &'static str, ctype: CType, ds: &'static str) -> Self {
        Self {
            cfield,
            ctype,
            dtype: DType::Scalar,
            ds,
            dsnp: false,
            big_endian: false,
            math: None,
        }
    }

    fn dsnp(mut self) -> Self {
        self.dsnp = true;
        self
    }

    fn big_endian(mut self) -> Self {
        self.big_endian = true;
        self
    }

    fn ip(mut self) -> Self {
        self.dtype = DType::Ip;
        self
    }
}

static MODEL_V4: Lazy<HashMap<&'static str, FieldSpec>> = Lazy::new(|| {
    HashMap::from([
        (
            "TCPHeaderLen",
            FieldSpec::new("tcp_header_len", CType::U16, "tcpi"),
        ),
        ("SRTT", FieldSpec::new("srtt_us", CType::U32, "tcpi")),
        (
            "DPort",
            FieldSpec::new("skc_dport", CType::U16, "sk->__sk_common")
                .dsnp()
                .big_endian(),
        ),
        (
            "TotalRetrans",
            FieldSpec::new("total_retrans", CType::U32, "tcpi"),
        ),
        ("AdvMSS", FieldSpec::new("advmss", CType::U16, "tcpi")),
        (
            "SAddr",
            FieldSpec::new("skc_rcv_saddr", CType::U32, "sk->__sk_common")
                .dsnp()
                .big_endian()
                .ip(),
        ),
        (
            "DAddr",
            FieldSpec::new("skc_daddr", CType::U32, "sk->__sk_common")
                .dsnp()
                .big_endian()
                .ip(),
        ),
        (
            "BytesReceived",
            FieldSpec::new("bytes_received", CType::U64, "tcpi"),
        ),
        ("BytesSent", FieldSpec::new("bytes_sent", CType::U64, "tcpi")),
        (
            "BytesAcked",
            FieldSpec::new("bytes_acked", CType::U64, "tcpi"),
        ),
        (
            "NumSAcks",
            FieldSpec::new("num_sacks", CType::U8, "tcpi->rx_opt").dsnp(),
        ),
        (
            "UserMSS",
            FieldSpec::new("user_mss", CType::U16, "tcpi->rx_opt").dsnp(),
        ),
        (
            "RTT",
            FieldSpec::new("rtt_us", CType::U32, "tcpi->rack").dsnp(),
        ),
        (
            "MSSClamp",
            FieldSpec::new("mss_clamp", CType::U16, "tcpi->rx_opt").dsnp(),
        ),
        (
            "Task",
            FieldSpec::new("current_comm", CType::Char, "bpf_get_current_comm"),
        ),
        (
            "PID",
            FieldSpec::new("pid", CType::U32, "bpf_get_current_pid_tgid"),
        ),
        ("SegsIn", FieldSpec::new("segs_in", CType::U32, "tcpi")),
        ("SegsOut", FieldSpec::new("segs_out", CType::U32, "tcpi")),
        ("DsackDups", FieldSpec::new("dsack_dups", CType::U32, "tcpi")),
        (
            "RateDelivered",
            FieldSpec::new("rate_delivered", CType::U32, "tcpi"),
        ),
        (
            "RateInterval",
            FieldSpec::new("rate_interval_us", CType::U32, "tcpi"),
        ),
    ])
});

// The IPv6 view: address fields change width and kernel source member.
static MODEL_V6: Lazy<HashMap<&'static str, FieldSpec>> = Lazy::new(|| {
    let mut model = MODEL_V4.clone();
    if let Some(saddr) = model.get_mut("SAddr") {
        saddr.ctype = CType::U128;
        saddr.cfield = "skc_v6_rcv_saddr";
    }
    if let Some(daddr) = model.get_mut("DAddr") {
        daddr.ctype = CType::U128;
        daddr.cfield = "skc_v6_daddr";
    }
    model
});

static ALIASES: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    MODEL_V4
        .keys()
        .map(|name| (name.to_lowercase(), *name))
        .collect()
});

const TCP_STATES: [&str; 12] = [
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
    "NEW_SYN_RECV",
];

const TRACEPOINTS: [&str; 7] = [
    "tcp:tcp_retransmit_skb",
    "tcp:tcp_retransmit_synack",
    "tcp:tcp_destroy_sock",
    "tcp:tcp_send_reset",
    "tcp:tcp_receive_reset",
    "tcp:tcp_probe",
    "sock:inet_sock_set_state",
];

/// Resolves a field name case-insensitively to its canonical catalog name.
pub fn resolve(name: &str) -> Result<&'static str, ConfigError> {
    ALIASES
        .get(&name.to_lowercase())
        .copied()
        .ok_or_else(|| ConfigError::UnknownField(name.to_string()))
}

/// IPv4 view of a canonical field name.
pub fn spec_v4(name: &str) -> Option<&'static FieldSpec> {
    MODEL_V4.get(name)
}

/// IPv6 view of a canonical field name.
pub fn spec_v6(name: &str) -> Option<&'static FieldSpec> {
    MODEL_V6.get(name)
}

pub fn spec(name: &str, v4: bool) -> Option<&'static FieldSpec> {
    if v4 {
        spec_v4(name)
    } else {
        spec_v6(name)
    }
}

/// Validates a TCP state name against the kernel's closed set and returns the
/// canonical `TCP_*` constant. Accepts any case, with or without the prefix.
pub fn validate_tcp_state(state: &str) -> Result<String, ConfigError> {
    let upper = state.to_uppercase();
    let bare = upper.strip_prefix("TCP_").unwrap_or(&upper);

    if TCP_STATES.contains(&bare) {
        Ok(format!("TCP_{bare}"))
    } else {
        Err(ConfigError::UnknownState(state.to_string()))
    }
}

/// Validates a tracepoint symbol against the supported set.
pub fn validate_tracepoint(name: &str) -> Result<(), ConfigError> {
    if TRACEPOINTS.contains(&name) {
        Ok(())
    } else {
        Err(ConfigError::UnknownTracepoint(name.to_string()))
    }
}
