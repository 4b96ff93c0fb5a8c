//! gRPC ingress: a streaming TCPDog service. Received messages are offered
//! to the flow channel without blocking; a full channel drops the record.

use std::net::SocketAddr;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use tcpdog_common::proto::tcp_dog_server::{TcpDog, TcpDogServer};
use tcpdog_common::proto::{Ack, Fields, FieldsSpb};
use tcpdog_common::tls::TlsConfig;

use crate::config::{self, ConfigError};
use crate::record::Record;

#[derive(Debug, Deserialize)]
pub struct GrpcIngressConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(flatten)]
    pub tls: TlsConfig,
}

fn default_addr() -> String {
    "0.0.0.0:8085".to_string()
}

struct IngressService {
    ch: mpsc::Sender<Record>,
}

impl IngressService {
    fn offer(&self, record: Record) {
        if self.ch.try_send(record).is_err() {
            log::error!("grpc: data has been dropped");
        }
    }
}

#[tonic::async_trait]
impl TcpDog for IngressService {
    async fn tracepoint(
        &self,
        request: Request<Streaming<Fields>>,
    ) -> Result<Response<Ack>, Status> {
        let peer = request.remote_addr();
        log::info!("grpc connect peer={peer:?}");

        let mut stream = request.into_inner();
        while let Some(fields) = stream.message().await? {
            self.offer(Record::Pb(fields));
        }

        log::info!("grpc disconnect peer={peer:?}");
        Ok(Response::new(Ack {}))
    }

    async fn tracepoint_spb(
        &self,
        request: Request<Streaming<FieldsSpb>>,
    ) -> Result<Response<Ack>, Status> {
        let peer = request.remote_addr();
        log::info!("grpc connect peer={peer:?}");

        let mut stream = request.into_inner();
        while let Some(fields) = stream.message().await? {
            self.offer(Record::Spb(fields));
        }

        log::info!("grpc disconnect peer={peer:?}");
        Ok(Response::new(Ack {}))
    }
}

pub async fn start(
    options: &serde_yaml::Value,
    ch: mpsc::Sender<Record>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let cfg: GrpcIngressConfig = config::transform(options)?;

    // accept the Go-style ":8085" shorthand
    let addr: SocketAddr = if cfg.addr.starts_with(':') {
        format!("0.0.0.0{}", cfg.addr).parse()
    } else {
        cfg.addr.parse()
    }
    .map_err(|e| ConfigError::BadAdapterConfig(format!("addr {}: {e}", cfg.addr)))?;

    let mut builder = Server::builder();
    if cfg.tls.enable {
        builder = builder.tls_config(cfg.tls.server()?)?;
    }

    let service = TcpDogServer::new(IngressService { ch });
    let server = builder
        .add_service(service)
        .serve_with_shutdown(addr, cancel.cancelled_owned());

    tokio::spawn(async move {
        if let Err(e) = server.await {
            log::error!("grpc server failed: {e}");
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcpdog_common::proto::tcp_dog_client::TcpDogClient;
    use tokio_stream::wrappers::ReceiverStream;

    async fn start_on_free_port(
        ch: mpsc::Sender<Record>,
        cancel: CancellationToken,
    ) -> String {
        // race-free enough for tests: bind to pick a port, release, reuse
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("addr"),
            serde_yaml::Value::from(addr.to_string()),
        )]))
        .unwrap();

        start(&options, ch, cancel).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        addr.to_string()
    }

    #[tokio::test]
    async fn receives_scalar_stream() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let addr = start_on_free_port(tx, cancel.clone()).await;

        let mut client = TcpDogClient::connect(format!("http://{addr}")).await.unwrap();
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let call = tokio::spawn(async move {
            client
                .tracepoint(Request::new(ReceiverStream::new(msg_rx)))
                .await
        });

        msg_tx
            .send(Fields {
                rtt: Some(7),
                timestamp: Some(1700000000),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = rx.recv().await.unwrap();
        match record {
            Record::Pb(fields) => {
                assert_eq!(fields.rtt, Some(7));
                assert_eq!(fields.timestamp, Some(1700000000));
            }
            other => panic!("unexpected record: {other:?}"),
        }

        drop(msg_tx);
        call.await.unwrap().unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_channel_drops_records() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let addr = start_on_free_port(tx, cancel.clone()).await;

        let mut client = TcpDogClient::connect(format!("http://{addr}")).await.unwrap();
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let call = tokio::spawn(async move {
            client
                .tracepoint(Request::new(ReceiverStream::new(msg_rx)))
                .await
        });

        for i in 0..5u32 {
            msg_tx
                .send(Fields {
                    rtt: Some(i),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        drop(msg_tx);
        call.await.unwrap().unwrap();

        // exactly one buffered; the rest were dropped without blocking
        let mut rx = rx;
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Record::Pb(_)));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
    }
}
