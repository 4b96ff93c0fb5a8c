//! gRPC egress: streams records to a TCPDog server, either as scalar `Fields`
//! (wire json → pb) or as structpb carriers. On any transport error the
//! stream is rebuilt under Backoff pacing; records wait in the upstream
//! channel while disconnected.

use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use tcpdog_common::proto::tcp_dog_client::TcpDogClient;
use tcpdog_common::proto::{Fields, FieldsSpb};
use tcpdog_common::tls::TlsConfig;
use tcpdog_common::Backoff;

use crate::config::{self, ConfigError};
use crate::dispatch::BufferPool;

use super::spb::StructPb;
use super::{fields_from_json, local_hostname};

#[derive(Debug, Deserialize)]
pub struct GrpcConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_server() -> String {
    "localhost:8085".to_string()
}

/// Starts the scalar-message mode: each record is parsed and re-shaped into
/// a `Fields` message with the local hostname injected.
pub fn start(
    options: &serde_yaml::Value,
    pool: Arc<BufferPool>,
    rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: GrpcConfig = config::transform(options)?;
    tokio::spawn(run_json(cfg, local_hostname(), pool, rx, cancel));
    Ok(())
}

/// Starts the structpb mode: records pass through the length-prefixed scan
/// instead of a JSON parser.
pub fn start_structpb(
    options: &serde_yaml::Value,
    fields: &[String],
    pool: Arc<BufferPool>,
    rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: GrpcConfig = config::transform(options)?;
    let spb = StructPb::new(fields, local_hostname());
    tokio::spawn(run_structpb(cfg, spb, pool, rx, cancel));
    Ok(())
}

async fn connect(cfg: &GrpcConfig) -> anyhow::Result<Channel> {
    // `insecure: true` forces a plaintext dial even when TLS material is set
    let use_tls = cfg.tls.enable && !cfg.insecure;

    let url = if cfg.server.contains("://") {
        cfg.server.clone()
    } else if use_tls {
        format!("https://{}", cfg.server)
    } else {
        format!("http://{}", cfg.server)
    };

    let mut endpoint = Endpoint::from_shared(url)?;
    if use_tls {
        endpoint = endpoint.tls_config(cfg.tls.client()?)?;
    }

    Ok(endpoint.connect().await?)
}

async fn run_json(
    cfg: GrpcConfig,
    hostname: String,
    pool: Arc<BufferPool>,
    mut rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new();

    'outer: loop {
        backoff.next().await;
        if cancel.is_cancelled() {
            return;
        }

        let channel = match connect(&cfg).await {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("grpc connect {} failed: {e}", cfg.server);
                continue;
            }
        };
        let mut client = TcpDogClient::new(channel);

        let (tx, stream) = mpsc::channel::<Fields>(1);
        let mut call = Box::pin(client.tracepoint(Request::new(ReceiverStream::new(stream))));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drop(tx);
                    let _ = call.await;
                    return;
                }
                result = &mut call => {
                    if let Err(e) = result {
                        log::warn!("grpc stream ended: {e}");
                    }
                    continue 'outer;
                }
                buf = rx.recv() => {
                    let Some(buf) = buf else {
                        drop(tx);
                        let _ = call.await;
                        return;
                    };

                    let parsed: Option<serde_json::Value> = serde_json::from_slice(&buf).ok();
                    pool.put(buf);

                    let Some(map) = parsed.as_ref().and_then(|v| v.as_object()) else {
                        log::warn!("grpc: undecodable record skipped");
                        continue;
                    };

                    if tx.send(fields_from_json(map, &hostname)).await.is_err() {
                        continue 'outer;
                    }
                }
            }
        }
    }
}

async fn run_structpb(
    cfg: GrpcConfig,
    spb: StructPb,
    pool: Arc<BufferPool>,
    mut rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new();

    'outer: loop {
        backoff.next().await;
        if cancel.is_cancelled() {
            return;
        }

        let channel = match connect(&cfg).await {
            Ok(channel) => channel,
            Err(e) => {
                log::warn!("grpc connect {} failed: {e}", cfg.server);
                continue;
            }
        };
        let mut client = TcpDogClient::new(channel);

        let (tx, stream) = mpsc::channel::<FieldsSpb>(1);
        let mut call = Box::pin(client.tracepoint_spb(Request::new(ReceiverStream::new(stream))));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drop(tx);
                    let _ = call.await;
                    return;
                }
                result = &mut call => {
                    if let Err(e) = result {
                        log::warn!("grpc stream ended: {e}");
                    }
                    continue 'outer;
                }
                buf = rx.recv() => {
                    let Some(buf) = buf else {
                        drop(tx);
                        let _ = call.await;
                        return;
                    };

                    let message = spb.unmarshal(&buf).map(|fields| FieldsSpb {
                        fields: Some(fields),
                    });
                    pool.put(buf);

                    let Some(message) = message else {
                        log::warn!("grpc: record layout mismatch");
                        continue;
                    };

                    if tx.send(message).await.is_err() {
                        continue 'outer;
                    }
                }
            }
        }
    }
}
