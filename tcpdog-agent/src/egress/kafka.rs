//! Kafka egress. The json serialization mutates the record tail with the
//! local hostname and hands it to the async producer; pb/spb run a pool of
//! marshaler workers feeding one producer loop through a bounded bytes
//! channel.

use std::sync::Arc;

use bytes::BytesMut;
use prost::Message;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tcpdog_common::proto::FieldsSpb;
use tcpdog_common::tls::TlsConfig;

use crate::config::{self, ConfigError};
use crate::dispatch::BufferPool;

use super::spb::StructPb;
use super::{fields_from_json, local_hostname};

const BYTES_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
    #[serde(default)]
    pub compression: String,
    #[serde(default = "default_retry_max", alias = "retry-max")]
    pub retry_max: u32,
    #[serde(default = "default_request_size_max", alias = "request-size-max")]
    pub request_size_max: i64,
    #[serde(default = "default_retry_backoff", alias = "retry-backoff")]
    pub retry_backoff: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default, alias = "sasl-username")]
    pub sasl_username: Option<String>,
    #[serde(default, alias = "sasl-password")]
    pub sasl_password: Option<String>,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_topic() -> String {
    "tcpdog".to_string()
}
fn default_serialization() -> String {
    "json".to_string()
}
fn default_retry_max() -> u32 {
    2
}
fn default_request_size_max() -> i64 {
    104857600
}
fn default_retry_backoff() -> u64 {
    10
}
fn default_workers() -> usize {
    2
}

pub fn start(
    options: &serde_yaml::Value,
    fields: &[String],
    pool: Arc<BufferPool>,
    rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: KafkaConfig = config::transform(options)?;
    let producer =
        build_producer(&cfg).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))?;
    let hostname = local_hostname();
    let serialization = cfg.serialization.clone();

    match serialization.as_str() {
        "json" => {
            tokio::spawn(run_json(cfg, producer, hostname, pool, rx, cancel));
        }
        "pb" | "spb" => {
            let spb_mode = cfg.serialization == "spb";
            let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>(BYTES_CHANNEL_CAPACITY);
            let shared_rx = Arc::new(Mutex::new(rx));

            for _ in 0..cfg.workers.max(1) {
                if spb_mode {
                    tokio::spawn(worker_spb(
                        StructPb::new(fields, hostname.clone()),
                        Arc::clone(&shared_rx),
                        bytes_tx.clone(),
                        Arc::clone(&pool),
                        cancel.clone(),
                    ));
                } else {
                    tokio::spawn(worker_pb(
                        hostname.clone(),
                        Arc::clone(&shared_rx),
                        bytes_tx.clone(),
                        Arc::clone(&pool),
                        cancel.clone(),
                    ));
                }
            }
            drop(bytes_tx);

            tokio::spawn(produce(producer, cfg.topic, bytes_rx, cancel));
        }
        other => {
            return Err(ConfigError::BadAdapterConfig(format!(
                "unknown kafka serialization: {other}"
            )))
        }
    }

    Ok(())
}

fn build_producer(cfg: &KafkaConfig) -> Result<FutureProducer, rdkafka::error::KafkaError> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", cfg.brokers.join(","))
        .set("client.id", "tcpdog")
        .set("message.send.max.retries", cfg.retry_max.to_string())
        .set("retry.backoff.ms", cfg.retry_backoff.to_string())
        .set("message.max.bytes", cfg.request_size_max.to_string());

    match cfg.compression.as_str() {
        "gzip" | "lz4" | "snappy" => {
            client.set("compression.codec", &cfg.compression);
        }
        _ => {
            client.set("compression.codec", "none");
        }
    }

    let sasl = cfg.sasl_username.is_some() && cfg.sasl_password.is_some();
    if cfg.tls.enable {
        client.set(
            "security.protocol",
            if sasl { "sasl_ssl" } else { "ssl" },
        );
        if let Some(ca) = &cfg.tls.ca {
            client.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &cfg.tls.cert {
            client.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &cfg.tls.key {
            client.set("ssl.key.location", key);
        }
        if cfg.tls.insecure_skip_verify {
            client.set("enable.ssl.certificate.verification", "false");
        }
    } else if sasl {
        client.set("security.protocol", "sasl_plaintext");
    }

    if sasl {
        client
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", cfg.sasl_username.as_deref().unwrap_or(""))
            .set("sasl.password", cfg.sasl_password.as_deref().unwrap_or(""));
    }

    client.create()
}

async fn run_json(
    cfg: KafkaConfig,
    producer: FutureProducer,
    hostname: String,
    pool: Arc<BufferPool>,
    mut rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) {
    let topic = cfg.topic;
    let tail = format!(",\"Hostname\":\"{hostname}\"}}");

    loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => return,
            buf = rx.recv() => match buf {
                Some(buf) => buf,
                None => return,
            },
        };

        // replace the closing brace with the hostname tail, leaving the
        // pooled buffer untouched
        let mut payload = Vec::with_capacity(buf.len() + tail.len());
        if buf.last() == Some(&b'}') {
            payload.extend_from_slice(&buf[..buf.len() - 1]);
            payload.extend_from_slice(tail.as_bytes());
        } else {
            payload.extend_from_slice(&buf);
        }
        pool.put(buf);

        let record = FutureRecord::<(), _>::to(&topic).payload(&payload);
        if let Err((e, _)) = producer.send(record, Timeout::Never).await {
            log::error!("kafka produce failed: {e}");
        }
    }
}

pub(crate) async fn worker_pb(
    hostname: String,
    rx: Arc<Mutex<mpsc::Receiver<BytesMut>>>,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) {
    loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => return,
            buf = recv_shared(&rx) => match buf {
                Some(buf) => buf,
                None => return,
            },
        };

        let parsed: Option<serde_json::Value> = serde_json::from_slice(&buf).ok();
        pool.put(buf);

        let Some(map) = parsed.as_ref().and_then(|v| v.as_object()) else {
            log::warn!("kafka: undecodable record skipped");
            continue;
        };

        let bytes = fields_from_json(map, &hostname).encode_to_vec();
        if bytes_tx.send(bytes).await.is_err() {
            return;
        }
    }
}

pub(crate) async fn worker_spb(
    spb: StructPb,
    rx: Arc<Mutex<mpsc::Receiver<BytesMut>>>,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
) {
    loop {
        let buf = tokio::select! {
            _ = cancel.cancelled() => return,
            buf = recv_shared(&rx) => match buf {
                Some(buf) => buf,
                None => return,
            },
        };

        let message = spb.unmarshal(&buf).map(|fields| FieldsSpb {
            fields: Some(fields),
        });
        pool.put(buf);

        let Some(message) = message else {
            log::warn!("kafka: record layout mismatch");
            continue;
        };

        if bytes_tx.send(message.encode_to_vec()).await.is_err() {
            return;
        }
    }
}

async fn recv_shared(rx: &Arc<Mutex<mpsc::Receiver<BytesMut>>>) -> Option<BytesMut> {
    rx.lock().await.recv().await
}

async fn produce(
    producer: FutureProducer,
    topic: String,
    mut bytes_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return,
            payload = bytes_rx.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };

        let record = FutureRecord::<(), _>::to(&topic).payload(&payload);
        if let Err((e, _)) = producer.send(record, Timeout::Never).await {
            log::error!("kafka produce failed: {e}");
        }
    }
}
