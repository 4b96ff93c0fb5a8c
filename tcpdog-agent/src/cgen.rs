//! BPF code generator: synthesizes the in-kernel C program from the field
//! catalog and the user configuration. The emitted struct member order is the
//! on-wire layout the decoder consumes, so any change here must be mirrored
//! in `decoder`.

use std::fmt::Write;

use crate::config::{Config, ConfigError, FieldRef, Tracepoint};
use crate::fields::{self, CType, FieldSpec};

const INCLUDES: &str = "#include <uapi/linux/ptrace.h>\n\
#include <net/sock.h>\n\
#include <bcc/proto.h>\n\
#include <linux/tcp.h>\n";

/// One struct member scheduled for emission.
struct CGenField {
    /// Destination member name, suffixed with the field's position so one
    /// group may reference a catalog name twice.
    member: String,
    /// Kernel source member.
    src: &'static str,
    ctype: CType,
    ds: &'static str,
    dsnp: bool,
    math: String,
    /// Filter expression, already rewritten to `data{4|6}.<member>`.
    filter: Option<String>,
}

impl CGenField {
    fn is_comm(&self) -> bool {
        self.ds == "bpf_get_current_comm"
    }

    fn is_pid_helper(&self) -> bool {
        self.ds == "bpf_get_current_pid_tgid"
    }

    fn is_helper(&self) -> bool {
        self.ds.starts_with("bpf_")
    }

    fn is_v6_addr(&self) -> bool {
        self.src == "skc_v6_rcv_saddr" || self.src == "skc_v6_daddr"
    }
}

/// Generates the full C translation unit for the configuration.
pub fn generate(cfg: &Config) -> Result<String, ConfigError> {
    let mut code = String::from(INCLUDES);

    for (index, tp) in cfg.tracepoints.iter().enumerate() {
        let group = cfg
            .fields
            .get(&tp.fields)
            .ok_or_else(|| ConfigError::UnknownFieldsGroup(tp.fields.clone()))?;

        let fields4 = if tp.inet.contains(&4) {
            Some(resolve_group(group, 4)?)
        } else {
            None
        };
        let fields6 = if tp.inet.contains(&6) {
            Some(resolve_group(group, 6)?)
        } else {
            None
        };

        code.push_str(&tracepoint_unit(index, tp, fields4.as_deref(), fields6.as_deref()));
    }

    Ok(code)
}

fn resolve_group(group: &[FieldRef], family: u8) -> Result<Vec<CGenField>, ConfigError> {
    let mut out = Vec::with_capacity(group.len());

    for (i, fref) in group.iter().enumerate() {
        let spec: &FieldSpec = fields::spec(&fref.name, family == 4)
            .ok_or_else(|| ConfigError::UnknownField(fref.name.clone()))?;

        let member = format!("{}{}", spec.cfield, i);
        let math = fref
            .math
            .clone()
            .or_else(|| spec.math.map(str::to_string))
            .unwrap_or_default();
        let filter = fref
            .filter
            .as_ref()
            .map(|f| f.replace(&fref.name, &format!("data{family}.{member}")));

        out.push(CGenField {
            member,
            src: spec.cfield,
            ctype: spec.ctype,
            ds: spec.ds,
            dsnp: spec.dsnp,
            math,
            filter,
        });
    }

    Ok(out)
}

fn tracepoint_unit(
    index: usize,
    tp: &Tracepoint,
    fields4: Option<&[CGenField]>,
    fields6: Option<&[CGenField]>,
) -> String {
    let mut out = String::new();
    let handler_tp = tp.name.replacen(':', "__", 1);

    for (family, fields) in [(4u8, fields4), (6u8, fields6)] {
        let Some(fields) = fields else { continue };

        if tp.sample > 0 {
            let _ = writeln!(
                out,
                "\nBPF_HASH(ipv{family}_sample{index}, struct sock *, u64, 100000);"
            );
        }

        let _ = writeln!(out, "\nstruct ipv{family}_data{index}_t {{");
        for field in fields {
            if field.ctype == CType::Char {
                let _ = writeln!(out, "    char {}[TASK_COMM_LEN];", field.member);
            } else {
                let _ = writeln!(out, "    {} {};", field.ctype.c_name(), field.member);
            }
        }
        let _ = writeln!(out, "}};");
        let _ = writeln!(out, "BPF_PERF_OUTPUT(ipv{family}_events{index});");
    }

    let _ = writeln!(out, "\nint sk_trace{index}(struct tracepoint__{handler_tp}* args)");
    let _ = writeln!(out, "{{");

    if tp.name == "sock:inet_sock_set_state" {
        let _ = writeln!(out, "    if (args->protocol != IPPROTO_TCP)");
        let _ = writeln!(out, "        return 0;");
        let _ = writeln!(out, "\n    if (args->newstate != {}) {{", tp.tcp_state);
        let _ = writeln!(out, "        return 0;");
        let _ = writeln!(out, "    }}");
    }

    let _ = writeln!(out, "\n    struct sock *sk = (struct sock *)args->skaddr;");

    let needs_tcpi = fields4
        .iter()
        .chain(fields6.iter())
        .flat_map(|fields| fields.iter())
        .any(|f| f.ds.contains("tcpi"));
    if needs_tcpi {
        let _ = writeln!(out, "    struct tcp_sock *tcpi = (struct tcp_sock *)sk;");
    }

    let _ = writeln!(out, "    u16 family = sk->__sk_common.skc_family;");

    if let Some(fields) = fields4 {
        out.push_str(&family_block(index, tp.sample, 4, fields));
    }
    if let Some(fields) = fields6 {
        out.push_str(&family_block(index, tp.sample, 6, fields));
    }

    let _ = writeln!(out, "\n    return 0;");
    let _ = writeln!(out, "}}");

    out
}

fn family_block(index: usize, sample: u64, family: u8, fields: &[CGenField]) -> String {
    let mut out = String::new();
    let af = if family == 4 { "AF_INET" } else { "AF_INET6" };
    let data = format!("data{family}");

    let _ = writeln!(out, "\n    struct ipv{family}_data{index}_t {data} = {{}};");
    let _ = writeln!(out, "\n    if (family == {af}) {{");

    // direct struct fills first
    for field in fields {
        if field.is_helper() {
            continue;
        }

        if family == 6 && field.is_v6_addr() {
            let _ = writeln!(
                out,
                "        bpf_probe_read(&{data}.{m}, sizeof({data}.{m}), {ds}.{src}.in6_u.u6_addr32);",
                m = field.member,
                ds = field.ds,
                src = field.src,
            );
        } else {
            let op = if field.dsnp { "." } else { "->" };
            let _ = writeln!(
                out,
                "        {data}.{m} = {ds}{op}{src}{math};",
                m = field.member,
                ds = field.ds,
                src = field.src,
                math = field.math,
            );
        }
    }

    // helpers are emitted as calls, never as struct reads
    for field in fields {
        if field.is_comm() {
            let _ = writeln!(
                out,
                "        bpf_get_current_comm(&{data}.{m}, sizeof({data}.{m}));",
                m = field.member,
            );
        } else if field.is_pid_helper() {
            let _ = writeln!(
                out,
                "        {data}.{m} = bpf_get_current_pid_tgid() >> 32;",
                m = field.member,
            );
        }
    }

    // filters are ANDed by early return
    for field in fields {
        if let Some(filter) = &field.filter {
            let _ = writeln!(out, "        if ({filter}) {{ return 0; }}");
        }
    }

    if sample > 0 {
        let table = format!("ipv{family}_sample{index}");
        let _ = writeln!(out, "\n        u64 *count;");
        let _ = writeln!(out, "        u64 zero = 0;");
        let _ = writeln!(out, "        count = {table}.lookup_or_try_init(&sk, &zero);");
        let _ = writeln!(out, "        if (!count) {{");
        let _ = writeln!(out, "            return 0;");
        let _ = writeln!(out, "        }}");
        let _ = writeln!(out, "        if (*count < {}) {{", sample.saturating_sub(1));
        let _ = writeln!(out, "            {table}.increment(sk);");
        let _ = writeln!(out, "            return 0;");
        let _ = writeln!(out, "        }}");
        let _ = writeln!(out, "        {table}.delete(&sk);");
    }

    let _ = writeln!(
        out,
        "\n        ipv{family}_events{index}.perf_submit(args, &{data}, sizeof({data}));"
    );
    let _ = writeln!(out, "        return 0;");
    let _ = writeln!(out, "    }}");

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config(yaml: &str) -> Config {
        let mut cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn one_table_and_struct_per_family() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "sock:inet_sock_set_state", fields: g, egress: e, inet: [4, 6]}
fields:
  g: [{name: rtt}, {name: saddr}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();

        assert_eq!(code.matches("BPF_PERF_OUTPUT(ipv4_events0);").count(), 1);
        assert_eq!(code.matches("BPF_PERF_OUTPUT(ipv6_events0);").count(), 1);
        assert_eq!(code.matches("struct ipv4_data0_t {").count(), 1);
        assert_eq!(code.matches("struct ipv6_data0_t {").count(), 1);
        assert!(code.contains("int sk_trace0(struct tracepoint__sock__inet_sock_set_state* args)"));
    }

    #[test]
    fn members_carry_position_suffix_in_order() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e}
fields:
  g: [{name: rtt}, {name: srtt}, {name: task}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();

        let rtt = code.find("u32 rtt_us0;").unwrap();
        let srtt = code.find("u32 srtt_us1;").unwrap();
        let task = code.find("char current_comm2[TASK_COMM_LEN];").unwrap();
        assert!(rtt < srtt && srtt < task);
    }

    #[test]
    fn filter_is_rewritten_and_early_returns() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "sock:inet_sock_set_state", fields: g, egress: e}
fields:
  g: [{name: srtt, filter: "srtt>1000"}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains("if (data4.srtt_us0>1000) { return 0; }"));
    }

    #[test]
    fn state_gate_for_inet_sock_set_state() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "sock:inet_sock_set_state", fields: g, egress: e, tcp_state: syn_sent}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains("if (args->protocol != IPPROTO_TCP)"));
        assert!(code.contains("if (args->newstate != TCP_SYN_SENT) {"));
    }

    #[test]
    fn no_state_gate_for_other_tracepoints() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_retransmit_skb", fields: g, egress: e}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(!code.contains("args->newstate"));
        assert!(code.contains("int sk_trace0(struct tracepoint__tcp__tcp_retransmit_skb* args)"));
    }

    #[test]
    fn sampling_block() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e, sample: 3}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains("BPF_HASH(ipv4_sample0, struct sock *, u64, 100000);"));
        assert!(code.contains("ipv4_sample0.lookup_or_try_init(&sk, &zero);"));
        // events 1..s-1 increment, event s submits
        assert!(code.contains("if (*count < 2) {"));
        assert!(code.contains("ipv4_sample0.delete(&sk);"));
    }

    #[test]
    fn helpers_emitted_as_calls() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e}
fields:
  g: [{name: task}, {name: pid}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains(
            "bpf_get_current_comm(&data4.current_comm0, sizeof(data4.current_comm0));"
        ));
        assert!(code.contains("data4.pid1 = bpf_get_current_pid_tgid() >> 32;"));
        assert!(!code.contains("data4.current_comm0 = "));
    }

    #[test]
    fn v6_addresses_use_probe_read() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e, inet: [6]}
fields:
  g: [{name: daddr}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains(
            "bpf_probe_read(&data6.skc_v6_daddr0, sizeof(data6.skc_v6_daddr0), \
             sk->__sk_common.skc_v6_daddr.in6_u.u6_addr32);"
        ));
        assert!(code.contains("if (family == AF_INET6) {"));
        assert!(!code.contains("AF_INET) {"));
    }

    #[test]
    fn user_math_overrides_source_expression() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e}
fields:
  g: [{name: srtt, math: " >> 3"}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        assert!(code.contains("data4.srtt_us0 = tcpi->srtt_us >> 3;"));
    }

    #[test]
    fn handler_ends_with_return_zero() {
        let cfg = config(
            r#"
tracepoints:
  - {name: "tcp:tcp_probe", fields: g, egress: e}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        );
        let code = generate(&cfg).unwrap();
        let handler = code.split("int sk_trace0").nth(1).unwrap();
        assert!(handler.trim_end().ends_with("return 0;\n}"));
    }
}
