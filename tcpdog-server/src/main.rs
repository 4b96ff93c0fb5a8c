use clap::Parser;
use tokio_util::sync::CancellationToken;

use tcpdog_server::{cli, config, flow};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    if args.version {
        println!("TCPDog version: {VERSION} [server]");
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: cli::Args) -> anyhow::Result<()> {
    let mut cfg = config::ServerConfig::load(&args.config)?;
    config::init_logger(&cfg.log);
    cfg.validate()?;

    log::info!("TCPDog version: {VERSION} [server]");

    let cancel = CancellationToken::new();
    flow::start(&cfg, cancel.clone()).await?;

    wait_for_shutdown().await;
    cancel.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
