//! Kafka ingress: a `tcpdog` consumer group reading from the oldest offset.
//! The consume loop commits messages as they are handed to an internal bytes
//! channel; unmarshal workers decode them per the flow serialization.

use std::collections::HashMap;
use std::sync::Arc;

use prost::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message as KafkaMessage;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tcpdog_common::proto::{Fields, FieldsSpb};
use tcpdog_common::tls::TlsConfig;
use tcpdog_common::Backoff;

use crate::config::{self, ConfigError};
use crate::record::{Record, Serialization};

const GROUP_ID: &str = "tcpdog";

#[derive(Debug, Deserialize)]
pub struct KafkaIngressConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Kafka protocol version hint for old brokers.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_topic() -> String {
    "tcpdog".to_string()
}
fn default_workers() -> usize {
    2
}

pub fn start(
    options: &serde_yaml::Value,
    serialization: Serialization,
    ch: mpsc::Sender<Record>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let cfg: KafkaIngressConfig = config::transform(options)?;
    let consumer = build_consumer(&cfg).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))?;

    // commit marks a message only once a worker has accepted it
    let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>(1);
    let bytes_rx = Arc::new(Mutex::new(bytes_rx));

    for _ in 0..cfg.workers.max(1) {
        tokio::spawn(unmarshal_worker(
            serialization,
            Arc::clone(&bytes_rx),
            ch.clone(),
            cancel.clone(),
        ));
    }

    let topic = cfg.topic.clone();
    tokio::spawn(consume(consumer, topic, bytes_tx, cancel));

    Ok(())
}

fn build_consumer(cfg: &KafkaIngressConfig) -> Result<StreamConsumer, rdkafka::error::KafkaError> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", cfg.brokers.join(","))
        .set("group.id", GROUP_ID)
        .set("client.id", "tcpdog")
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false");

    if let Some(version) = &cfg.version {
        client.set("broker.version.fallback", version);
    }

    if cfg.tls.enable {
        client.set("security.protocol", "ssl");
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
    }

    client.create()
}

async fn consume(
    consumer: StreamConsumer,
    topic: String,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    if let Err(e) = consumer.subscribe(&[&topic]) {
        log::error!("kafka subscribe {topic} failed: {e}");
        return;
    }

    let mut backoff = Backoff::new();

    loop {
        backoff.next().await;

        loop {
            let message = tokio::select! {
                // dropping the consumer closes the group
                _ = cancel.cancelled() => return,
                message = consumer.recv() => message,
            };

            match message {
                Ok(message) => {
                    if let Some(payload) = message.payload() {
                        if bytes_tx.send(payload.to_vec()).await.is_err() {
                            return;
                        }
                    }
                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        log::warn!("kafka commit failed: {e}");
                    }
                }
                Err(e) => {
                    log::error!("kafka consume failed: {e}");
                    break;
                }
            }
        }
    }
}

async fn unmarshal_worker(
    serialization: Serialization,
    bytes_rx: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    ch: mpsc::Sender<Record>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return,
            bytes = recv_shared(&bytes_rx) => match bytes {
                Some(bytes) => bytes,
                None => return,
            },
        };

        let record = match unmarshal(serialization, &bytes) {
            Ok(record) => record,
            Err(e) => {
                log::error!("kafka unmarshal failed: {e}");
                continue;
            }
        };

        if ch.send(record).await.is_err() {
            return;
        }
    }
}

async fn recv_shared(rx: &Arc<Mutex<mpsc::Receiver<Vec<u8>>>>) -> Option<Vec<u8>> {
    rx.lock().await.recv().await
}

fn unmarshal(serialization: Serialization, bytes: &[u8]) -> anyhow::Result<Record> {
    match serialization {
        Serialization::Json => {
            let map: HashMap<String, serde_json::Value> = serde_json::from_slice(bytes)?;
            Ok(Record::Json(map.into_iter().collect()))
        }
        Serialization::Pb => Ok(Record::Pb(Fields::decode(bytes)?)),
        Serialization::Spb => Ok(Record::Spb(FieldsSpb::decode(bytes)?)),
    }
}
