//! Loader facade: the one boundary where kernel-version-specific code lives.
//! The core only sees this narrow interface, so the whole pipeline is
//! testable with a mock that replays canned perf bytes.

use std::collections::HashMap;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(feature = "bcc")]
mod bcc_loader;
#[cfg(feature = "bcc")]
pub use bcc_loader::BccLoader;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("bpf program load failed: {0}")]
    Load(String),
    #[error("attach {tracepoint} failed: {reason}")]
    Attach { tracepoint: String, reason: String },
    #[error("perf table not found: {0}")]
    UnknownTable(String),
    #[error("built without kernel loader support (enable the `bcc` feature)")]
    Unavailable,
}

/// Compiles, loads and attaches the generated program and surfaces one perf
/// ring read endpoint per (tracepoint, inet-family) output table.
pub trait Loader: Send {
    fn load(&mut self, source: &str) -> Result<(), LoaderError>;

    fn attach_tracepoint(&mut self, tracepoint: &str, handler: &str) -> Result<(), LoaderError>;

    fn open_perf_buffer(
        &mut self,
        table: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BytesMut>, LoaderError>;

    /// Begins record delivery once every table is open.
    fn start(&mut self) {}

    /// Detaches and releases kernel resources.
    fn close(&mut self);
}

/// Constructs the production loader. Fails when the binary was built without
/// kernel support.
pub fn kernel_loader() -> Result<Box<dyn Loader>, LoaderError> {
    #[cfg(feature = "bcc")]
    {
        Ok(Box::new(BccLoader::new()))
    }
    #[cfg(not(feature = "bcc"))]
    {
        Err(LoaderError::Unavailable)
    }
}

/// Test loader: records every call and lets tests feed raw records into the
/// perf channels it handed out.
#[derive(Default)]
pub struct MockLoader {
    pub source: Option<String>,
    pub attached: Vec<(String, String)>,
    pub closed: bool,
    senders: HashMap<String, mpsc::Sender<BytesMut>>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one canned record into an open perf table.
    pub async fn inject(&self, table: &str, record: &[u8]) {
        if let Some(tx) = self.senders.get(table) {
            let _ = tx.send(BytesMut::from(record)).await;
        }
    }

    pub fn open_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.senders.keys().cloned().collect();
        tables.sort();
        tables
    }
}

impl Loader for MockLoader {
    fn load(&mut self, source: &str) -> Result<(), LoaderError> {
        self.source = Some(source.to_string());
        Ok(())
    }

    fn attach_tracepoint(&mut self, tracepoint: &str, handler: &str) -> Result<(), LoaderError> {
        self.attached
            .push((tracepoint.to_string(), handler.to_string()));
        Ok(())
    }

    fn open_perf_buffer(
        &mut self,
        table: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BytesMut>, LoaderError> {
        let (tx, rx) = mpsc::channel(capacity);
        self.senders.insert(table.to_string(), tx);
        Ok(rx)
    }

    fn close(&mut self) {
        self.senders.clear();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_replays_canned_records() {
        let mut loader = MockLoader::new();
        loader.load("int sk_trace0() { return 0; }").unwrap();
        loader
            .attach_tracepoint("sock:inet_sock_set_state", "sk_trace0")
            .unwrap();

        let mut rx = loader.open_perf_buffer("ipv4_events0", 10).unwrap();
        loader.inject("ipv4_events0", &[1, 2, 3, 4]).await;

        let record = rx.recv().await.unwrap();
        assert_eq!(&record[..], &[1, 2, 3, 4]);
        assert_eq!(loader.attached.len(), 1);
        assert_eq!(loader.open_tables(), vec!["ipv4_events0".to_string()]);
    }
}
