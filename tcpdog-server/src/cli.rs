//! Server command line interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tcpdog-server", about = "TCPDog server", disable_version_flag = true)]
pub struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', default_value = "/etc/tcpdog/server.yaml")]
    pub config: PathBuf,

    /// Print version and exit
    #[arg(long)]
    pub version: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_path() {
        let args = Args::parse_from(["tcpdog-server"]);
        assert_eq!(args.config, PathBuf::from("/etc/tcpdog/server.yaml"));
        assert!(!args.version);
    }

    #[test]
    fn config_flag() {
        let args = Args::parse_from(["tcpdog-server", "-c", "/tmp/server.yaml"]);
        assert_eq!(args.config, PathBuf::from("/tmp/server.yaml"));
    }
}
