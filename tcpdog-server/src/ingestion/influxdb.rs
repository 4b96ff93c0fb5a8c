//! InfluxDB ingestion: shaper workers turn records into `tcpdog` measurement
//! points (strings become tags, numbers become fields); the writer batches
//! points and posts line protocol through the `PointWriter` seam.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tcpdog_common::columns::{ColumnValue, COLUMNS};
use tcpdog_common::tls::TlsConfig;
use tcpdog_common::Backoff;

use crate::config::{self, ConfigError};
use crate::geo::Geoer;
use crate::record::{Record, Serialization};

use super::{geo_attributes, recv_shared};

const POINT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct InfluxConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_retries", alias = "max-retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size", alias = "batch-size")]
    pub batch_size: usize,
    /// Max seconds a partial batch may wait before it is written.
    #[serde(default = "default_flush_interval", alias = "flush-interval")]
    pub flush_interval: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_geo_field", alias = "geoField", alias = "geo-field")]
    pub geo_field: String,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_url() -> String {
    "http://localhost:8086".to_string()
}
fn default_bucket() -> String {
    "tcpdog".to_string()
}
fn default_timeout() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    10
}
fn default_batch_size() -> usize {
    200
}
fn default_flush_interval() -> u64 {
    1
}
fn default_workers() -> usize {
    2
}
fn default_geo_field() -> String {
    "DAddr".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Int(i64),
}

/// One shaped measurement point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: i64,
}

/// The backend seam: receives rendered line-protocol batches.
#[async_trait]
pub trait PointWriter: Send + Sync {
    async fn write(&self, body: String) -> anyhow::Result<()>;
}

/// Production writer: InfluxDB v2 HTTP write endpoint.
pub struct HttpPointWriter {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl HttpPointWriter {
    pub fn new(cfg: &InfluxConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(cfg.timeout));
        if cfg.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            client: builder.build()?,
            url: format!(
                "{}/api/v2/write?org={}&bucket={}&precision=s",
                cfg.url.trim_end_matches('/'),
                cfg.org,
                cfg.bucket
            ),
            token: cfg.token.clone(),
        })
    }
}

#[async_trait]
impl PointWriter for HttpPointWriter {
    async fn write(&self, body: String) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .header("Authorization", format!("Token {}", self.token))
            .body(body)
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
    let cfg: InfluxConfig = config::transform(options)?;
    let writer = HttpPointWriter::new(&cfg)
        .map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))?;
    start_with_writer(cfg, serialization, geo, Arc::new(writer), rx, cancel);
    Ok(())
}

pub fn start_with_writer(
    cfg: InfluxConfig,
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    writer: Arc<dyn PointWriter>,
    rx: mpsc::Receiver<Record>,
    cancel: CancellationToken,
) {
    let (point_tx, point_rx) = mpsc::channel(POINT_CHANNEL_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let geo_field = Arc::new(cfg.geo_field.clone());

    for _ in 0..cfg.workers.max(1) {
        tokio::spawn(point_worker(
            serialization,
            geo.clone(),
            Arc::clone(&geo_field),
            Arc::clone(&rx),
            point_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(point_tx);

    tokio::spawn(write_loop(cfg, writer, point_rx, cancel));
}

async fn point_worker(
    serialization: Serialization,
    geo: Option<Arc<dyn Geoer>>,
    geo_field: Arc<String>,
    rx: Arc<Mutex<mpsc::Receiver<Record>>>,
    point_tx: mpsc::Sender<Point>,
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

        let Some(point) = shape(serialization, &geo, &geo_field, &record) else {
            log::warn!("influxdb: record does not match serialization, skipped");
            continue;
        };

        if point_tx.send(point).await.is_err() {
            return;
        }
    }
}

/// Builds a point from the record. Strings become tags (the geo field
/// expanding into the provider's attributes); numbers become fields — f64
/// for json/spb, i64 for pb.
fn shape(
    serialization: Serialization,
    geo: &Option<Arc<dyn Geoer>>,
    geo_field: &str,
    record: &Record,
) -> Option<Point> {
    let mut point = Point {
        tags: BTreeMap::new(),
        fields: BTreeMap::new(),
        timestamp: 0,
    };

    let geo_attrs = geo_attributes(geo, record, geo_field);

    match (serialization, record) {
        (Serialization::Json, Record::Json(map)) => {
            for (key, value) in map {
                match value {
                    Value::String(v) => {
                        if key == geo_field && !geo_attrs.is_empty() {
                            point.tags.extend(geo_attrs.clone());
                            continue;
                        }
                        point.tags.insert(key.clone(), v.clone());
                    }
                    Value::Number(n) => {
                        if key == "Timestamp" {
                            point.timestamp = n.as_i64().unwrap_or(0);
                        } else if let Some(v) = n.as_f64() {
                            point.fields.insert(key.clone(), FieldValue::Float(v));
                        }
                    }
                    _ => {}
                }
            }
        }
        (Serialization::Pb, Record::Pb(fields)) => {
            for col in COLUMNS {
                match (col.get)(fields) {
                    Some(ColumnValue::Str(v)) => {
                        if col.name == geo_field && !geo_attrs.is_empty() {
                            point.tags.extend(geo_attrs.clone());
                            continue;
                        }
                        point.tags.insert(col.name.to_string(), v);
                    }
                    Some(ColumnValue::U32(v)) => {
                        point
                            .fields
                            .insert(col.name.to_string(), FieldValue::Int(i64::from(v)));
                    }
                    Some(ColumnValue::U64(v)) => {
                        point
                            .fields
                            .insert(col.name.to_string(), FieldValue::Int(v as i64));
                    }
                    None => {}
                }
            }
            if !fields.hostname.is_empty() {
                point
                    .tags
                    .insert("Hostname".to_string(), fields.hostname.clone());
            }
            point.timestamp = fields.timestamp.unwrap_or(0);
        }
        (Serialization::Spb, Record::Spb(spb)) => {
            let fields = spb.fields.as_ref()?;
            for (key, value) in &fields.fields {
                match value.kind.as_ref() {
                    Some(prost_types::value::Kind::StringValue(v)) => {
                        if key == geo_field && !geo_attrs.is_empty() {
                            point.tags.extend(geo_attrs.clone());
                            continue;
                        }
                        point.tags.insert(key.clone(), v.clone());
                    }
                    Some(prost_types::value::Kind::NumberValue(v)) => {
                        if key == "Timestamp" {
                            point.timestamp = *v as i64;
                        } else {
                            point.fields.insert(key.clone(), FieldValue::Float(*v));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => return None,
    }

    Some(point)
}

async fn write_loop(
    cfg: InfluxConfig,
    writer: Arc<dyn PointWriter>,
    mut point_rx: mpsc::Receiver<Point>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(cfg.flush_interval.max(1));
    let mut body = String::new();
    let mut counter = 0usize;

    let timer = tokio::time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&cfg, writer.as_ref(), &mut body, &mut counter).await;
                return;
            }
            _ = &mut timer => {
                if counter > 0 {
                    flush(&cfg, writer.as_ref(), &mut body, &mut counter).await;
                }
                timer.as_mut().reset(tokio::time::Instant::now() + interval);
            }
            point = point_rx.recv() => {
                let Some(point) = point else {
                    flush(&cfg, writer.as_ref(), &mut body, &mut counter).await;
                    return;
                };
                render_line(&point, &mut body);
                counter += 1;
                if counter >= cfg.batch_size {
                    flush(&cfg, writer.as_ref(), &mut body, &mut counter).await;
                }
            }
        }
    }
}

async fn flush(cfg: &InfluxConfig, writer: &dyn PointWriter, body: &mut String, counter: &mut usize) {
    if *counter == 0 {
        return;
    }

    let batch = std::mem::take(body);
    *counter = 0;

    let mut backoff = Backoff::new();
    for attempt in 0..=cfg.max_retries {
        backoff.next().await;
        match writer.write(batch.clone()).await {
            Ok(()) => return,
            Err(e) => log::error!("influxdb write failed (attempt {attempt}): {e}"),
        }
    }
    log::error!("influxdb batch dropped after {} retries", cfg.max_retries);
}

/// Renders one point as a line-protocol line.
fn render_line(point: &Point, out: &mut String) {
    out.push_str("tcpdog");

    for (key, value) in &point.tags {
        let _ = write!(out, ",{}={}", escape_tag(key), escape_tag(value));
    }

    out.push(' ');
    let mut first = true;
    for (key, value) in &point.fields {
        if !first {
            out.push(',');
        }
        first = false;
        match value {
            FieldValue::Float(v) => {
                let _ = write!(out, "{}={v}", escape_tag(key));
            }
            FieldValue::Int(v) => {
                let _ = write!(out, "{}={v}i", escape_tag(key));
            }
        }
    }

    let _ = writeln!(out, " {}", point.timestamp);
}

fn escape_tag(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::testutil::StaticGeo;
    use std::collections::HashMap;

    struct CaptureWriter {
        bodies: Mutex<Vec<String>>,
        notify: mpsc::Sender<String>,
    }

    #[async_trait]
    impl PointWriter for CaptureWriter {
        async fn write(&self, body: String) -> anyhow::Result<()> {
            self.bodies.lock().await.push(body.clone());
            let _ = self.notify.send(body).await;
            Ok(())
        }
    }

    fn json_record() -> Record {
        Record::Json(
            serde_json::from_str(r#"{"DAddr":"1.2.3.4","RTT":5,"Timestamp":1700000000}"#).unwrap(),
        )
    }

    fn geo() -> Option<Arc<dyn Geoer>> {
        Some(Arc::new(StaticGeo {
            ip: "1.2.3.4".to_string(),
            attrs: HashMap::from([
                ("City".to_string(), "X".to_string()),
                ("Country".to_string(), "Y".to_string()),
            ]),
        }))
    }

    #[test]
    fn json_shaping_with_geo() {
        let point = shape(Serialization::Json, &geo(), "DAddr", &json_record()).unwrap();

        assert_eq!(point.tags.get("City").unwrap(), "X");
        assert_eq!(point.tags.get("Country").unwrap(), "Y");
        // the looked-up address is replaced by its attributes
        assert!(!point.tags.contains_key("DAddr"));
        assert_eq!(point.fields.get("RTT"), Some(&FieldValue::Float(5.0)));
        assert_eq!(point.timestamp, 1700000000);
    }

    #[test]
    fn pb_shaping_uses_int_fields() {
        let record = Record::Pb(tcpdog_common::proto::Fields {
            rtt: Some(5),
            bytes_sent: Some(900),
            daddr: Some("8.8.8.8".to_string()),
            hostname: "h1".to_string(),
            timestamp: Some(1700000000),
            ..Default::default()
        });
        let point = shape(Serialization::Pb, &None, "DAddr", &record).unwrap();

        assert_eq!(point.fields.get("RTT"), Some(&FieldValue::Int(5)));
        assert_eq!(point.fields.get("BytesSent"), Some(&FieldValue::Int(900)));
        assert_eq!(point.tags.get("DAddr").unwrap(), "8.8.8.8");
        assert_eq!(point.tags.get("Hostname").unwrap(), "h1");
        assert_eq!(point.timestamp, 1700000000);
    }

    #[test]
    fn line_rendering() {
        let point = Point {
            tags: BTreeMap::from([
                ("City".to_string(), "New York".to_string()),
                ("Country".to_string(), "US".to_string()),
            ]),
            fields: BTreeMap::from([
                ("RTT".to_string(), FieldValue::Float(5.0)),
                ("Retrans".to_string(), FieldValue::Int(2)),
            ]),
            timestamp: 1700000000,
        };

        let mut out = String::new();
        render_line(&point, &mut out);
        assert_eq!(
            out,
            "tcpdog,City=New\\ York,Country=US RTT=5,Retrans=2i 1700000000\n"
        );
    }

    #[tokio::test]
    async fn end_to_end_flow_batches_and_writes() {
        let (notify_tx, mut notify_rx) = mpsc::channel(4);
        let writer = Arc::new(CaptureWriter {
            bodies: Mutex::new(Vec::new()),
            notify: notify_tx,
        });

        let cfg = InfluxConfig {
            batch_size: 1,
            ..config::transform(&serde_yaml::Value::Null).unwrap()
        };

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        start_with_writer(
            cfg,
            Serialization::Json,
            geo(),
            writer.clone(),
            rx,
            cancel.clone(),
        );

        tx.send(json_record()).await.unwrap();

        let body = notify_rx.recv().await.unwrap();
        assert_eq!(body, "tcpdog,City=X,Country=Y RTT=5 1700000000\n");

        cancel.cancel();
    }

    #[tokio::test]
    async fn size_triggered_batching() {
        let (notify_tx, mut notify_rx) = mpsc::channel(8);
        let writer = Arc::new(CaptureWriter {
            bodies: Mutex::new(Vec::new()),
            notify: notify_tx,
        });

        let cfg = InfluxConfig {
            batch_size: 2,
            flush_interval: 3600,
            ..config::transform(&serde_yaml::Value::Null).unwrap()
        };

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        start_with_writer(
            cfg,
            Serialization::Json,
            None,
            writer.clone(),
            rx,
            cancel.clone(),
        );

        for _ in 0..4 {
            tx.send(json_record()).await.unwrap();
        }

        let first = notify_rx.recv().await.unwrap();
        let second = notify_rx.recv().await.unwrap();
        assert_eq!(first.lines().count(), 2);
        assert_eq!(second.lines().count(), 2);

        cancel.cancel();
    }
}
