//! Elasticsearch ingestion: each record becomes an `index` bulk action whose
//! body is the geo-enriched JSON document. The bulk buffer flushes on a byte
//! threshold or a time interval through the `BulkSink` seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tcpdog_common::columns::{ColumnValue, COLUMNS};
use tcpdog_common::tls::TlsConfig;
use tcpdog_common::Backoff;

use crate::config::{self, ConfigError};
use crate::geo::Geoer;
use crate::record::{Record, Serialization};

use super::{geo_attributes, recv_shared};

const ITEM_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct EsConfig {
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_index")]
    pub index: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, alias = "api-key")]
    pub api_key: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Flush threshold in bytes.
    #[serde(default = "default_flush_bytes", alias = "flush-bytes")]
    pub flush_bytes: usize,
    /// Periodic flush interval in seconds.
    #[serde(default = "default_flush_interval", alias = "flush-interval")]
    pub flush_interval: u64,
    #[serde(default = "default_geo_field", alias = "geoField", alias = "geo-field")]
    pub geo_field: String,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_urls() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}
fn default_index() -> String {
    "tcpdog".to_string()
}
fn default_workers() -> usize {
    2
}
fn default_flush_bytes() -> usize {
    5 << 20
}
fn default_flush_interval() -> u64 {
    30
}
fn default_geo_field() -> String {
    "DAddr".to_string()
}

/// The backend seam: receives an ndjson `_bulk` body.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk(&self, body: Vec<u8>) -> anyhow::Result<()>;
}

/// Production sink: the `_bulk` endpoint of the first configured URL.
pub struct HttpBulkSink {
    client: reqwest::Client,
    url: String,
    username: String,
    password: String,
    api_key: Option<String>,
}

impl HttpBulkSink {
    pub fn new(cfg: &EsConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if cfg.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let base = cfg
            .urls
            .first()
            .ok_or_else(|| anyhow::anyhow!("elasticsearch urls must not be empty"))?;

        Ok(Self {
            client: builder.build()?,
            url: format!("{}/{}/_bulk", base.trim_end_matches('/'), cfg.index),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl BulkSink for HttpBulkSink {
    async fn bulk(&self, body: Vec<u8>) -> anyhow::Result<()> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("ApiKey {api_key}"));
        } else if !self.username.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        request.send().await?.error_for_status()?;
        Ok(())
    }
}

pub fn start(
    options: &serde_yaml::Value,
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: EsConfig = config::transform(options)?;
    let sink = HttpBulkSink::new(&cfg).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))?;
    start_with_sink(cfg, serialization, geo, Arc::new(sink), rx, cancel);
    Ok(())
}

pub fn start_with_sink(
    cfg: EsConfig,
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    sink: Arc<dyn BulkSink>,
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) {
    let (item_tx, item_rx) = mpsc::channel(ITEM_CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let geo_field = Arc::new(cfg.geo_field.clone());

    for _ in 0..cfg.workers.max(1) {
        tokio::spawn(item_worker(
            serialization,
            geo.clone(),
            Arc::clone(&geo_field),
            Arc::clone(&rx),
            item_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(item_tx);

    tokio::spawn(bulk_loop(cfg, sink, item_rx, cancel));
}

async fn item_worker(
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    geo_field: Arc<String>,
    rx: Arc<Mutex<mpsc::Receiver<Record>>>,
    item_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => return,
            record = recv_shared(&rx) => match record {
                Some(record) => record,
                None => return,
            },
        };

        let Some(doc) = document(serialization, &geo, &geo_field, &record) else {
            log::warn!("elasticsearch: record does not match serialization, skipped");
            continue;
        };

        let Ok(body) = serde_json::to_vec(&doc) else {
            continue;
        };
        if item_tx.send(body).await.is_err() {
            return;
        }
    }
}

/// Builds the JSON document for one record, merging geo attributes as
/// additional document fields.
fn document(
    serialization: Serialization,
    geo: &Option<Arc<dyn Geoer>>,
    geo_field: &str,
    record: &Record,
) -> Option<Map<String, Value>> {
    let geo_attrs = geo_attributes(geo, record, geo_field);

    let mut doc = match (serialization, record) {
        (Serialization::Json, Record::Json(map)) => map.clone(),
        (Serialization::Pb, Record::Pb(fields)) => {
            let mut doc = Map::new();
            for col in COLUMNS {
                match (col.get)(fields) {
                    Some(ColumnValue::Str(v)) => {
                        doc.insert(col.name.to_string(), Value::String(v));
                    }
                    Some(ColumnValue::U32(v)) => {
                        doc.insert(col.name.to_string(), Value::Number(v.into()));
                    }
                    Some(ColumnValue::U64(v)) => {
                        doc.insert(col.name.to_string(), Value::Number(v.into()));
                    }
                    None => {}
                }
            }
            if !fields.hostname.is_empty() {
                doc.insert(
                    "Hostname".to_string(),
                    Value::String(fields.hostname.clone()),
                );
            }
            if let Some(ts) = fields.timestamp {
                doc.insert("Timestamp".to_string(), Value::Number(ts.into()));
            }
            doc
        }
        (Serialization::Spb, Record::Spb(spb)) => {
            let fields = spb.fields.as_ref()?;
            let mut doc = Map::new();
            for (key, value) in &fields.fields {
                match value.kind.as_ref() {
                    Some(prost_types::value::Kind::StringValue(v)) => {
                        doc.insert(key.clone(), Value::String(v.clone()));
                    }
                    Some(prost_types::value::Kind::NumberValue(v)) => {
                        let number = if v.fract() == 0.0 {
                            Number::from(*v as i64)
                        } else {
                            Number::from_f64(*v)?
                        };
                        doc.insert(key.clone(), Value::Number(number));
                    }
                    _ => {}
                }
            }
            doc
        }
        _ => return None,
    };

    for (key, value) in geo_attrs {
        doc.insert(key, Value::String(value));
    }

    Some(doc)
}

async fn bulk_loop(
    cfg: EsConfig,
    sink: Arc<dyn BulkSink>,
    mut item_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(cfg.flush_interval.max(1));
    let mut body: Vec<u8> = Vec::new();
    let mut count = 0usize;
    let mut backoff = Backoff::new();
    backoff.next().await;

    let timer = tokio::time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(sink.as_ref(), &mut body, &mut count, &mut backoff).await;
                return;
            }
            _ = &mut timer => {
                if count > 0 {
                    flush(sink.as_ref(), &mut body, &mut count, &mut backoff).await;
                }
                timer.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            item = item_rx.recv() => {
                let Some(item) = item else {
                    flush(sink.as_ref(), &mut body, &mut count, &mut backoff).await;
                    return;
                };
                body.extend_from_slice(b"{\"index\":{}}\n");
                body.extend_from_slice(&item);
                body.push(b'\n');
                count += 1;
                if body.len() >= cfg.flush_bytes {
                    flush(sink.as_ref(), &mut body, &mut count, &mut backoff).await;
                }
            }
        }
    }
}

async fn flush(sink: &dyn BulkSink, body: &mut Vec<u8>, count: &mut usize, backoff: &mut Backoff) {
    if *count == 0 {
        return;
    }
    let batch = std::mem::take(body);
    *count = 0;

    if let Err(e) = sink.bulk(batch).await {
        log::error!("elasticsearch bulk failed: {e}");
        backoff.next().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::testutil::StaticGeo;
    use std::collections::HashMap;

    struct CaptureSink {
        notify: mpsc::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl BulkSink for CaptureSink {
        async fn bulk(&self, body: Vec<u8>) -> anyhow::Result<()> {
            let _ = self.notify.send(body).await;
            Ok(())
        }
    }

    fn geo() -> Option<Arc<dyn Geoer>> {
        Some(Arc::new(StaticGeo {
            ip: "1.2.3.4".to_string(),
            attrs: HashMap::from([("City".to_string(), "X".to_string())]),
        }))
    }

    #[test]
    fn json_document_keeps_address_and_adds_geo() {
        let record = Record::Json(
            serde_json::from_str(r#"{"DAddr":"1.2.3.4","RTT":5,"Timestamp":1700000000}"#).unwrap(),
        );
        let doc = document(Serialization::Json, &geo(), "DAddr", &record).unwrap();

        assert_eq!(doc["DAddr"], "1.2.3.4");
        assert_eq!(doc["City"], "X");
        assert_eq!(doc["RTT"], 5);
    }

    #[test]
    fn pb_document_through_column_map() {
        let record = Record::Pb(tcpdog_common::proto::Fields {
            rtt: Some(5),
            task: Some("curl".to_string()),
            hostname: "h1".to_string(),
            timestamp: Some(1700000000),
            ..Default::default()
        });
        let doc = document(Serialization::Pb, &None, "DAddr", &record).unwrap();

        assert_eq!(doc["RTT"], 5);
        assert_eq!(doc["Task"], "curl");
        assert_eq!(doc["Hostname"], "h1");
        assert_eq!(doc["Timestamp"], 1700000000);
    }

    #[tokio::test]
    async fn byte_threshold_triggers_flush() {
        let (notify_tx, mut notify_rx) = mpsc::channel(4);
        let sink = Arc::new(CaptureSink { notify: notify_tx });

        let cfg = EsConfig {
            flush_bytes: 1, // every record flushes
            flush_interval: 3600,
            ..config::transform(&serde_yaml::Value::Null).unwrap()
        };

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        start_with_sink(cfg, Serialization::Json, None, sink, rx, cancel.clone());

        tx.send(Record::Json(
            serde_json::from_str(r#"{"RTT":5,"Timestamp":1700000000}"#).unwrap(),
        ))
        .await
        .unwrap();

        let body = notify_rx.recv().await.unwrap();
        let text = String::from_utf8(body).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(r#"{"index":{}}"#));
        let doc: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(doc["RTT"], 5);

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_flushes_pending_items() {
        let (notify_tx, mut notify_rx) = mpsc::channel(4);
        let sink = Arc::new(CaptureSink { notify: notify_tx });

        let cfg = EsConfig {
            flush_interval: 3600,
            ..config::transform(&serde_yaml::Value::Null).unwrap()
        };

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        start_with_sink(cfg, Serialization::Json, None, sink, rx, cancel.clone());

        tx.send(Record::Json(
            serde_json::from_str(r#"{"RTT":9,"Timestamp":1}"#).unwrap(),
        ))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cancel.cancel();
        let body = notify_rx.recv().await.unwrap();
        assert!(String::from_utf8(body).unwrap().contains(r#""RTT":9"#));
    }
}
