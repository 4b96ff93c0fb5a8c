//! Static column map over the `Fields` message.
//!
//! The server's ingestion adapters and the agent's protobuf marshalers both
//! need to move values between catalog field names and `Fields` members.
//! Instead of runtime reflection, this table pairs each catalog name with its
//! kind and accessor functions, resolved once at configuration time.

use crate::proto::Fields;

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    U32(u32),
    U64(u64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    U32,
    U64,
    Str,
}

pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub get: fn(&Fields) -> Option<ColumnValue>,
    pub set: fn(&mut Fields, ColumnValue),
}

macro_rules! col_u32 {
    ($name:literal, $field:ident) => {
        Column {
            name: $name,
            kind: ColumnKind::U32,
            get: |f| f.$field.map(ColumnValue::U32),
            set: |f, v| {
                if let ColumnValue::U32(v) = v {
                    f.$field = Some(v);
                }
            },
        }
    };
}

macro_rules! col_u64 {
    ($name:literal, $field:ident) => {
        Column {
            name: $name,
            kind: ColumnKind::U64,
            get: |f| f.$field.map(ColumnValue::U64),
            set: |f, v| {
                if let ColumnValue::U64(v) = v {
                    f.$field = Some(v);
                }
            },
        }
    };
}

macro_rules! col_str {
    ($name:literal, $field:ident) => {
        Column {
            name: $name,
            kind: ColumnKind::Str,
            get: |f| f.$field.clone().map(ColumnValue::Str),
            set: |f, v| {
                if let ColumnValue::Str(v) = v {
                    f.$field = Some(v);
                }
            },
        }
    };
}

/// One entry per catalog field, in catalog order. `Hostname` and `Timestamp`
/// are plain members of `Fields` and are handled by the callers directly.
pub static COLUMNS: &[Column] = &[
    col_u32!("TCPHeaderLen", tcp_header_len),
    col_u32!("SRTT", srtt),
    col_u32!("DPort", dport),
    col_u32!("TotalRetrans", total_retrans),
    col_u32!("AdvMSS", advmss),
    col_str!("SAddr", saddr),
    col_str!("DAddr", daddr),
    col_u64!("BytesReceived", bytes_received),
    col_u64!("BytesSent", bytes_sent),
    col_u64!("BytesAcked", bytes_acked),
    col_u32!("NumSAcks", num_sacks),
    col_u32!("UserMSS", user_mss),
    col_u32!("RTT", rtt),
    col_u32!("MSSClamp", mss_clamp),
    col_str!("Task", task),
    col_u32!("PID", pid),
    col_u32!("SegsIn", segs_in),
    col_u32!("SegsOut", segs_out),
    col_u32!("DsackDups", dsack_dups),
    col_u32!("RateDelivered", rate_delivered),
    col_u32!("RateInterval", rate_interval),
];

/// Looks up a column by catalog name.
pub fn find(name: &str) -> Option<&'static Column> {
    COLUMNS.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_kinds() {
        let mut f = Fields::default();

        let rtt = find("RTT").unwrap();
        assert_eq!(rtt.kind, ColumnKind::U32);
        (rtt.set)(&mut f, ColumnValue::U32(5));
        assert_eq!((rtt.get)(&f), Some(ColumnValue::U32(5)));

        let bytes = find("BytesSent").unwrap();
        (bytes.set)(&mut f, ColumnValue::U64(1 << 40));
        assert_eq!((bytes.get)(&f), Some(ColumnValue::U64(1 << 40)));

        let daddr = find("DAddr").unwrap();
        (daddr.set)(&mut f, ColumnValue::Str("1.2.3.4".into()));
        assert_eq!((daddr.get)(&f), Some(ColumnValue::Str("1.2.3.4".into())));
    }

    #[test]
    fn unknown_name() {
        assert!(find("NoSuchField").is_none());
    }

    #[test]
    fn unset_members_yield_none() {
        let f = Fields::default();
        for col in COLUMNS {
            assert_eq!((col.get)(&f), None, "{}", col.name);
        }
    }
}
