//! Ingestion adapters: consume a flow channel of polymorphic records, apply
//! geo enrichment, and forward shaped points/items/rows to their backend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, Flow, ServerConfig};
use crate::geo::Geoer;
use crate::record::{Record, Serialization};

pub mod clickhouse;
pub mod elasticsearch;
pub mod influxdb;

/// Starts the ingestion named by the flow on the receiver side of its channel.
pub async fn start(
    cfg: &ServerConfig,
    flow: &Flow,
    geo: Option<Arc<dyn Geoer>>,
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ingestion = cfg
        .ingestion
        .get(&flow.ingestion)
        .ok_or_else(|| ConfigError::UnknownIngestion(flow.ingestion.clone()))?;
    let serialization = Serialization::parse(&flow.serialization)
        .ok_or_else(|| ConfigError::UnknownSerialization(flow.serialization.clone()))?;

    match ingestion.kind.as_str() {
        "influxdb" => {
            influxdb::start(&ingestion.config, serialization, geo, rx, cancel)?;
            log::info!("influxdb ingestion {} has been started", flow.ingestion);
        }
        "elasticsearch" => {
            elasticsearch::start(&ingestion.config, serialization, geo, rx, cancel)?;
            log::info!("elasticsearch ingestion {} has been started", flow.ingestion);
        }
        "clickhouse" => {
            clickhouse::start(&ingestion.config, serialization, geo, rx, cancel)?;
            log::info!("clickhouse ingestion {} has been started", flow.ingestion);
        }
        other => anyhow::bail!("unknown ingestion type: {other}"),
    }

    Ok(())
}

/// Looks up the record's geo field and returns the provider's attribute map.
pub(crate) fn geo_attributes(
    geo: &Option<Arc<dyn Geoer>>,
    record: &Record,
    geo_field: &str,
) -> HashMap<String, String> {
    let Some(geo) = geo else {
        return HashMap::new();
    };
    record
        .get_str(geo_field)
        .and_then(|ip| geo.get(&ip))
        .unwrap_or_default()
}

pub(crate) async fn recv_shared<T>(rx: &Arc<Mutex<mpsc::Receiver<T>>>) -> Option<T> {
    rx.lock().await.recv().await
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Fixed-answer geo provider for adapter tests.
    pub struct StaticGeo {
        pub ip: String,
        pub attrs: HashMap<String, String>,
    }

    impl Geoer for StaticGeo {
        fn get(&self, ip: &str) -> Option<HashMap<String, String>> {
            (ip == self.ip).then(|| self.attrs.clone())
        }
    }
}
