//! Ingress adapters: receive records from remote agents and offer them to a
//! flow channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Flow, ServerConfig};
use crate::record::{Record, Serialization};

pub mod grpc;
pub mod kafka;

/// Starts the ingress named by the flow on the sender side of its channel.
pub async fn start(
    cfg: &ServerConfig,
    flow: &Flow,
    ch: mpsc::Sender<Record>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ingress = cfg
        .ingress
        .get(&flow.ingress)
        .ok_or_else(|| ConfigError::UnknownIngress(flow.ingress.clone()))?;
    let serialization = Serialization::parse(&flow.serialization)
        .ok_or_else(|| ConfigError::UnknownSerialization(flow.serialization.clone()))?;

    match ingress.kind.as_str() {
        "grpc" => {
            grpc::start(&ingress.config, ch, cancel).await?;
            log::info!("grpc ingress {} has been started", flow.ingress);
        }
        "kafka" => {
            kafka::start(&ingress.config, serialization, ch, cancel)?;
            log::info!("kafka ingress {} has been started", flow.ingress);
        }
        other => anyhow::bail!("unknown ingress type: {other}"),
    }

    Ok(())
}
