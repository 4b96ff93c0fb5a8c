use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tcpdog_agent::{cgen, cli, config, dispatch, egress, loader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    if args.version {
        println!("TCPDog version: {VERSION} [agent]");
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run(args: cli::Args) -> anyhow::Result<()> {
    let mut cfg = cli::build_config(&args)?;
    config::init_logger(&cfg.log);
    cfg.validate()?;
    cli::check_root()?;

    let code = cgen::generate(&cfg)?;
    let mut loader = loader::kernel_loader()?;
    loader.load(&code)?;

    let cancel = CancellationToken::new();
    let pool = Arc::new(dispatch::BufferPool::new());

    // one channel and one adapter per unique egress name; tracepoints that
    // share a name fan in on the same sender
    let mut channels: HashMap<String, mpsc::Sender<BytesMut>> = HashMap::new();
    for tp in &cfg.tracepoints {
        if channels.contains_key(&tp.egress) {
            continue;
        }
        let (tx, rx) = mpsc::channel(dispatch::CHANNEL_CAPACITY);
        egress::start(&cfg, tp, Arc::clone(&pool), rx, cancel.clone()).await?;
        channels.insert(tp.egress.clone(), tx);
    }

    dispatch::start(&cfg, loader.as_mut(), Arc::clone(&pool), &channels, cancel.clone())?;
    loader.start();

    log::info!("TCPDog version: {VERSION} [agent]");

    wait_for_shutdown().await;

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    loader.close();

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
