//! Flow router: binds each configured ingress to its ingestion through one
//! bounded record channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::record::Record;
use crate::{geo, ingestion, ingress};

/// Capacity of every flow channel.
pub const CHANNEL_CAPACITY: usize = 1000;

/// Starts every configured flow. The geo provider is initialized once and
/// shared read-only across ingestion adapters.
pub async fn start(cfg: &ServerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let geo = geo::from_config(cfg.geo.as_ref())?;

    for flow in &cfg.flow {
        let (tx, rx) = mpsc::channel::<Record>(CHANNEL_CAPACITY);
        ingress::start(cfg, flow, tx, cancel.clone()).await?;
        ingestion::start(cfg, flow, geo.clone(), rx, cancel.clone()).await?;
    }

    Ok(())
}
