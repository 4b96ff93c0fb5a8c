//! Command line interface. Flags synthesize a one-tracepoint console
//! configuration when no YAML file is given.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, ConfigError, EgressConfig, FieldRef, LogConfig, Tracepoint};

#[derive(Parser, Debug)]
#[command(name = "tcpdog", about = "TCPDog agent", disable_version_flag = true)]
pub struct Args {
    /// Tracepoint name
    #[arg(long = "tracepoint", alias = "tp", default_value = "sock:inet_sock_set_state")]
    pub tracepoint: String,

    /// Comma-separated TCP fields
    #[arg(long, short = 'f', default_value = "rtt,totalretrans,saddr,daddr,dport")]
    pub fields: String,

    /// Enable IPv4 addresses (default when --ipv6 is off)
    #[arg(long = "ipv4", short = '4')]
    pub ipv4: bool,

    /// Enable IPv6 addresses
    #[arg(long = "ipv6", short = '6')]
    pub ipv6: bool,

    /// TCP state
    #[arg(long, short = 's', default_value = "TCP_CLOSE")]
    pub state: String,

    /// Sample rate: submit one record out of every N per socket
    #[arg(long, short = 'a', default_value_t = 0)]
    pub sample: u64,

    /// Number of decoder workers
    #[arg(long, short = 'w', default_value_t = 1)]
    pub workers: usize,

    /// Path to a YAML configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Print version and exit
    #[arg(long)]
    pub version: bool,
}

/// Loads the YAML configuration, or builds one from the flags.
pub fn build_config(args: &Args) -> Result<Config, ConfigError> {
    if let Some(path) = &args.config {
        return Config::load(path);
    }

    let inet = if args.ipv6 && !args.ipv4 {
        vec![6]
    } else if args.ipv6 {
        vec![4, 6]
    } else {
        vec![4]
    };

    let refs: Vec<FieldRef> = args
        .fields
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| FieldRef {
            name: name.to_string(),
            math: None,
            filter: None,
        })
        .collect();

    Ok(Config {
        tracepoints: vec![Tracepoint {
            name: args.tracepoint.clone(),
            fields: "cli".to_string(),
            tcp_state: args.state.clone(),
            sample: args.sample,
            workers: args.workers,
            inet,
            egress: "console".to_string(),
        }],
        fields: HashMap::from([("cli".to_string(), refs)]),
        egress: HashMap::from([(
            "console".to_string(),
            EgressConfig {
                kind: "console".to_string(),
                config: serde_yaml::Value::Null,
            },
        )]),
        log: LogConfig::default(),
    })
}

/// Attaching BPF programs needs root; `TCPDOG_TEST=true` bypasses the check.
pub fn check_root() -> anyhow::Result<()> {
    if std::env::var("TCPDOG_TEST").as_deref() == Ok("true") {
        return Ok(());
    }

    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("root permission required");
    }

    Ok(())
}
