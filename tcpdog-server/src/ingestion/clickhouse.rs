//! ClickHouse ingestion. Marshaler workers turn records into column-ordered
//! rows; each connection worker owns one transaction from the `RowStore`
//! seam and commits it when the batch fills or the flush timer fires. A
//! transaction idle for too many timer cycles is discarded and reopened so
//! the connection does not die underneath it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tcpdog_common::columns::{self, ColumnKind};
use tcpdog_common::tls::TlsConfig;
use tcpdog_common::Backoff;

use crate::config::{self, ConfigError};
use crate::geo::Geoer;
use crate::record::{Record, Serialization};

use super::{geo_attributes, recv_shared};

const ROW_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct ChConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_geo_field", alias = "geoField", alias = "geo-field")]
    pub geo_field: String,
    /// ClickHouse table column names, in insert order.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Record field names feeding the columns, in the same order.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Number of connection workers, each owning a transaction.
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Number of marshaler workers preparing rows.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size", alias = "batch-size")]
    pub batch_size: usize,
    /// Flush timer in seconds.
    #[serde(default = "default_flush_interval", alias = "flush-interval")]
    pub flush_interval: u64,
    /// Idle connection ceiling in seconds.
    #[serde(default = "default_conn_timeout", alias = "conn-timeout")]
    pub conn_timeout: u64,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_table() -> String {
    "tcpdog".to_string()
}
fn default_geo_field() -> String {
    "SAddr".to_string()
}
fn default_connections() -> usize {
    1
}
fn default_workers() -> usize {
    2
}
fn default_batch_size() -> usize {
    100
}
fn default_flush_interval() -> u64 {
    2
}
fn default_conn_timeout() -> u64 {
    300
}

/// One cell of a column-ordered row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    U32(u32),
    U64(u64),
    Str(String),
    Null,
}

/// The backend seam: opens one transaction at a time per connection worker.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn begin(&self) -> anyhow::Result<Box<dyn RowTx>>;
}

/// A transaction holding buffered rows; dropped without commit = discarded.
#[async_trait]
pub trait RowTx: Send {
    async fn exec(&mut self, row: Vec<RowValue>) -> anyhow::Result<()>;
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

/// Production store over the ClickHouse HTTP interface: rows buffer locally
/// and commit as one `INSERT ... FORMAT JSONEachRow` request.
pub struct HttpRowStore {
    client: reqwest::Client,
    url: String,
    query: String,
    columns: Vec<String>,
}

impl HttpRowStore {
    pub fn new(cfg: &ChConfig) -> anyhow::Result<Self> {
        if cfg.columns.is_empty() || cfg.columns.len() != cfg.fields.len() {
            anyhow::bail!("clickhouse columns and fields must be non-empty and equal length");
        }

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if cfg.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            url: cfg.url.clone(),
            query: format!(
                "INSERT INTO {} ({}) FORMAT JSONEachRow",
                cfg.table,
                cfg.columns.join(",")
            ),
            columns: cfg.columns.clone(),
        })
    }
}

#[async_trait]
impl RowStore for HttpRowStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn RowTx>> {
        Ok(Box::new(HttpRowTx {
            client: self.client.clone(),
            url: self.url.clone(),
            query: self.query.clone(),
            columns: self.columns.clone(),
            body: Vec::new(),
        }))
    }
}

struct HttpRowTx {
    client: reqwest::Client,
    url: String,
    query: String,
    columns: Vec<String>,
    body: Vec<u8>,
}

#[async_trait]
impl RowTx for HttpRowTx {
    async fn exec(&mut self, row: Vec<RowValue>) -> anyhow::Result<()> {
        let mut doc = serde_json::Map::new();
        for (column, value) in self.columns.iter().zip(row) {
            let value = match value {
                RowValue::U32(v) => Value::Number(v.into()),
                RowValue::U64(v) => Value::Number(v.into()),
                RowValue::Str(v) => Value::String(v),
                RowValue::Null => Value::Null,
            };
            doc.insert(column.clone(), value);
        }
        self.body.extend_from_slice(&serde_json::to_vec(&doc)?);
        self.body.push(b'\n');
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        if self.body.is_empty() {
            return Ok(());
        }
        self.client
            .post(&self.url)
            .query(&[("query", self.query.as_str())])
            .body(self.body)
            .send()
            .await?
            .error_for_status()?;
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
    let cfg: ChConfig = config::transform(options)?;
    let store =
        HttpRowStore::new(&cfg).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))?;
    start_with_store(cfg, serialization, geo, Arc::new(store), rx, cancel);
    Ok(())
}

pub fn start_with_store(
    cfg: ChConfig,
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    store: Arc<dyn RowStore>,
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) {
    let cfg = Arc::new(cfg);
    let (row_tx, row_rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let row_rx = Arc::new(Mutex::new(row_rx));

    for _ in 0..cfg.workers.max(1) {
        tokio::spawn(row_worker(
            Arc::clone(&cfg),
            serialization,
            geo.clone(),
            Arc::clone(&rx),
            row_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(row_tx);

    for _ in 0..cfg.connections.max(1) {
        tokio::spawn(ingest(
            Arc::clone(&cfg),
            Arc::clone(&store),
            Arc::clone(&row_rx),
            cancel.clone(),
        ));
    }
}

async fn row_worker(
    cfg: Arc<ChConfig>,
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    rx: Arc<Mutex<mpsc::Receiver<Record>>>,
    row_tx: mpsc::Sender<Vec<RowValue>>,
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

        let Some(row) = shape_row(&cfg, serialization, &geo, &record) else {
            log::warn!("clickhouse: record does not match serialization, skipped");
            continue;
        };

        if row_tx.send(row).await.is_err() {
            return;
        }
    }
}

/// Builds the column-ordered row for one record. Field kinds come from the
/// column map; names the map does not know (geo attributes, extra strings)
/// fall back to the geo attribute set and then to the record itself.
fn shape_row(
    cfg: &ChConfig,
    serialization: Serialization,
    geo: &Option<Arc<dyn Geoer>>,
    record: &Record,
) -> Option<Vec<RowValue>> {
    // records must match the flow serialization
    match (serialization, record) {
        (Serialization::Json, Record::Json(_))
        | (Serialization::Pb, Record::Pb(_))
        | (Serialization::Spb, Record::Spb(_)) => {}
        _ => return None,
    }

    let geo_attrs = geo_attributes(geo, record, &cfg.geo_field);
    let mut row = Vec::with_capacity(cfg.fields.len());

    for name in &cfg.fields {
        if name == "Timestamp" {
            row.push(
                record
                    .timestamp()
                    .map(|ts| RowValue::U64(ts as u64))
                    .unwrap_or(RowValue::Null),
            );
            continue;
        }

        let value = match columns::find(name) {
            Some(col) => match col.kind {
                ColumnKind::U32 => extract_u32(record, name),
                ColumnKind::U64 => record.get_num(name).map(RowValue::U64),
                ColumnKind::Str => record.get_str(name).map(RowValue::Str),
            },
            // geo attributes and other string-valued names (e.g. Hostname)
            None => geo_attrs
                .get(name)
                .cloned()
                .or_else(|| record.get_str(name))
                .map(RowValue::Str),
        };

        row.push(value.unwrap_or(RowValue::Null));
    }

    Some(row)
}

fn extract_u32(record: &Record, name: &str) -> Option<RowValue> {
    record.get_num(name).map(|v| RowValue::U32(v as u32))
}

async fn ingest(
    cfg: Arc<ChConfig>,
    store: Arc<dyn RowStore>,
    rows: Arc<Mutex<mpsc::Receiver<Vec<RowValue>>>>,
    cancel: CancellationToken,
) {
    let flush_interval = cfg.flush_interval.max(1);
    let interval = Duration::from_secs(flush_interval);
    // timer cycles an empty transaction may survive before it is reopened
    let idle_limit = (cfg.conn_timeout.div_ceil(flush_interval)).saturating_sub(1).max(1);
    let mut backoff = Backoff::new();

    'outer: loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut tx = match store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                log::error!("clickhouse begin failed: {e}");
                backoff.next().await;
                continue;
            }
        };

        let mut counter = 0usize;
        let mut idle_cycles = 0u64;
        let timer = tokio::time::sleep(interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // commit whatever is pending and exit
                    if let Err(e) = tx.commit().await {
                        log::error!("clickhouse commit failed: {e}");
                    }
                    return;
                }
                row = recv_shared(&rows) => {
                    let Some(row) = row else {
                        if let Err(e) = tx.commit().await {
                            log::error!("clickhouse commit failed: {e}");
                        }
                        return;
                    };
                    if let Err(e) = tx.exec(row).await {
                        log::error!("clickhouse exec failed: {e}");
                    }
                    counter += 1;
                    if counter >= cfg.batch_size {
                        break;
                    }
                }
                _ = &mut timer => {
                    if counter > 0 {
                        break;
                    }
                    timer.as_mut().reset(tokio::time::Instant::now() + interval);
                    idle_cycles += 1;
                    if idle_cycles >= idle_limit {
                        // idle transaction: discard and reopen
                        continue 'outer;
                    }
                }
            }
        }

        if let Err(e) = tx.commit().await {
            log::error!("clickhouse commit failed: {e}");
            backoff.next().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::testutil::StaticGeo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockStore {
        begins: AtomicUsize,
        commits: mpsc::Sender<Vec<Vec<RowValue>>>,
    }

    struct MockTx {
        rows: Vec<Vec<RowValue>>,
        commits: mpsc::Sender<Vec<Vec<RowValue>>>,
    }

    #[async_trait]
    impl RowStore for MockStore {
        async fn begin(&self) -> anyhow::Result<Box<dyn RowTx>> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockTx {
                rows: Vec::new(),
                commits: self.commits.clone(),
            }))
        }
    }

    #[async_trait]
    impl RowTx for MockTx {
        async fn exec(&mut self, row: Vec<RowValue>) -> anyhow::Result<()> {
            self.rows.push(row);
            Ok(())
        }

        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            let _ = self.commits.send(self.rows).await;
            Ok(())
        }
    }

    fn test_cfg(batch_size: usize, flush_interval: u64, conn_timeout: u64) -> ChConfig {
        ChConfig {
            batch_size,
            flush_interval,
            conn_timeout,
            connections: 1,
            workers: 1,
            columns: vec!["rtt".into(), "city".into(), "ts".into()],
            fields: vec!["RTT".into(), "City".into(), "Timestamp".into()],
            ..config::transform(&serde_yaml::Value::Null).unwrap()
        }
    }

    fn json_record() -> Record {
        Record::Json(
            serde_json::from_str(r#"{"SAddr":"1.2.3.4","RTT":5,"Timestamp":1700000000}"#).unwrap(),
        )
    }

    fn geo() -> Option<Arc<dyn Geoer>> {
        Some(Arc::new(StaticGeo {
            ip: "1.2.3.4".to_string(),
            attrs: HashMap::from([("City".to_string(), "X".to_string())]),
        }))
    }

    #[test]
    fn rows_follow_configured_column_order() {
        let cfg = test_cfg(10, 2, 300);
        let row = shape_row(&cfg, Serialization::Json, &geo(), &json_record()).unwrap();
        assert_eq!(
            row,
            vec![
                RowValue::U32(5),
                RowValue::Str("X".to_string()),
                RowValue::U64(1700000000),
            ]
        );
    }

    #[test]
    fn missing_fields_become_null() {
        let cfg = test_cfg(10, 2, 300);
        let record = Record::Json(serde_json::from_str(r#"{"Timestamp":1}"#).unwrap());
        let row = shape_row(&cfg, Serialization::Json, &None, &record).unwrap();
        assert_eq!(row[0], RowValue::Null);
        assert_eq!(row[1], RowValue::Null);
    }

    #[test]
    fn pb_records_shape_through_column_map() {
        let cfg = test_cfg(10, 2, 300);
        let record = Record::Pb(tcpdog_common::proto::Fields {
            rtt: Some(7),
            timestamp: Some(42),
            ..Default::default()
        });
        let row = shape_row(&cfg, Serialization::Pb, &None, &record).unwrap();
        assert_eq!(row[0], RowValue::U32(7));
        assert_eq!(row[2], RowValue::U64(42));
    }

    #[test]
    fn mismatched_serialization_is_rejected() {
        let cfg = test_cfg(10, 2, 300);
        assert!(shape_row(&cfg, Serialization::Pb, &None, &json_record()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn batch_size_commits() {
        let (commit_tx, mut commit_rx) = mpsc::channel(8);
        let store = Arc::new(MockStore {
            begins: AtomicUsize::new(0),
            commits: commit_tx,
        });

        let cfg = test_cfg(2, 3600, 7200);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        start_with_store(
            cfg,
            Serialization::Json,
            None,
            store.clone(),
            rx,
            cancel.clone(),
        );

        // 2 * batch_size inputs: exactly 2 commits
        for _ in 0..4 {
            tx.send(json_record()).await.unwrap();
        }

        let first = commit_rx.recv().await.unwrap();
        let second = commit_rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn flush_timer_commits_partial_batch() {
        let (commit_tx, mut commit_rx) = mpsc::channel(8);
        let store = Arc::new(MockStore {
            begins: AtomicUsize::new(0),
            commits: commit_tx,
        });

        let cfg = test_cfg(100, 2, 300);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        start_with_store(
            cfg,
            Serialization::Json,
            None,
            store.clone(),
            rx,
            cancel.clone(),
        );

        tx.send(json_record()).await.unwrap();

        // the paused clock advances straight to the flush timer
        let committed = commit_rx.recv().await.unwrap();
        assert_eq!(committed.len(), 1);

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_transaction_is_reopened() {
        let (commit_tx, mut commit_rx) = mpsc::channel(8);
        let store = Arc::new(MockStore {
            begins: AtomicUsize::new(0),
            commits: commit_tx,
        });

        // conn_timeout 4 / flush 2 -> one idle cycle allowed
        let cfg = test_cfg(100, 2, 4);
        let (_tx, rx) = mpsc::channel::<Record>(16);
        let cancel = CancellationToken::new();
        start_with_store(
            cfg,
            Serialization::Json,
            None,
            store.clone(),
            rx,
            cancel.clone(),
        );

        // no rows at all: the first transaction must be discarded and a new
        // one opened without any commit
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.begins.load(Ordering::SeqCst) >= 2);
        assert!(commit_rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_commits_pending_rows() {
        let (commit_tx, mut commit_rx) = mpsc::channel(8);
        let store = Arc::new(MockStore {
            begins: AtomicUsize::new(0),
            commits: commit_tx,
        });

        let cfg = test_cfg(100, 3600, 7200);
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        start_with_store(
            cfg,
            Serialization::Json,
            None,
            store.clone(),
            rx,
            cancel.clone(),
        );

        tx.send(json_record()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let committed = commit_rx.recv().await.unwrap();
        assert_eq!(committed.len(), 1);
    }
}
