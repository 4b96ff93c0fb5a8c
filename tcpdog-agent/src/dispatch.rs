//! Dispatcher: owns the buffer pool and the bounded egress channels, and runs
//! one pool of decoder workers per (tracepoint, inet-family).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::decoder::{DecodeError, Decoder};
use crate::loader::Loader;

/// Capacity of every bounded channel in the agent data plane.
pub const CHANNEL_CAPACITY: usize = 1000;

const BUFFER_CAPACITY: usize = 512;
const POOL_LIMIT: usize = 4096;

/// Multi-producer/multi-consumer free list of decode buffers. Every path that
/// takes a buffer out must eventually put it back.
pub struct BufferPool {
    free: std::sync::Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> BytesMut {
        self.free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_CAPACITY))
    }

    pub fn put(&self, buf: BytesMut) {
        if let Ok(mut free) = self.free.lock() {
            if free.len() < POOL_LIMIT {
                free.push(buf);
            }
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Attaches every configured tracepoint and spawns the decoder workers. The
/// `channels` map carries one sender per unique egress name; the matching
/// adapters already own the receivers.
pub fn start(
    cfg: &Config,
    loader: &mut dyn Loader,
    pool: Arc<BufferPool>,
    channels: &HashMap<String, mpsc::Sender<BytesMut>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    for (index, tp) in cfg.tracepoints.iter().enumerate() {
        loader.attach_tracepoint(&tp.name, &format!("sk_trace{index}"))?;

        let names = cfg.tp_field_names(&tp.fields);
        let out = channels
            .get(&tp.egress)
            .with_context(|| format!("no channel for egress {}", tp.egress))?
            .clone();

        for family in &tp.inet {
            let table = format!("ipv{family}_events{index}");
            let rx = loader.open_perf_buffer(&table, CHANNEL_CAPACITY)?;
            let rx = Arc::new(Mutex::new(rx));

            for _ in 0..tp.workers.max(1) {
                let decoder = Decoder::new(&names, *family == 4)?;
                tokio::spawn(worker(
                    decoder,
                    Arc::clone(&rx),
                    out.clone(),
                    Arc::clone(&pool),
                    cancel.clone(),
                ));
            }
        }
    }

    Ok(())
}

async fn worker(
    decoder: Decoder,
    rx: Arc<Mutex<mpsc::Receiver<BytesMut>>>,
    out: mpsc::Sender<BytesMut>,
    pool: Arc<BufferPool>,
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

        let mut buf = pool.get();
        buf.clear();

        match decoder.decode(&record, &mut buf) {
            Ok(()) => {}
            Err(e @ DecodeError::CorruptSchema(_)) => {
                // config / code-gen mismatch: unrecoverable for this stream
                log::error!("decoder: {e}");
                pool.put(buf);
                return;
            }
            Err(e) => {
                log::warn!("decoder: {e}");
                pool.put(buf);
                continue;
            }
        }

        match out.try_send(buf) {
            Ok(()) => {}
            Err(TrySendError::Full(buf)) => {
                log::warn!("egress channel maxed out");
                pool.put(buf);
            }
            Err(TrySendError::Closed(buf)) => {
                pool.put(buf);
                return;
            }
        }
    }
}

async fn recv_shared(rx: &Arc<Mutex<mpsc::Receiver<BytesMut>>>) -> Option<BytesMut> {
    rx.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MockLoader;
    use tokio::time::{sleep, Duration};

    fn test_config() -> Config {
        let mut cfg: Config = serde_yaml::from_str(
            r#"
tracepoints:
  - {name: "sock:inet_sock_set_state", fields: g, egress: e, inet: [4], workers: 2}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        )
        .unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[tokio::test]
    async fn decodes_injected_records_in_order() {
        let cfg = test_config();
        let mut loader = MockLoader::new();
        let pool = Arc::new(BufferPool::new());
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channels = HashMap::from([("e".to_string(), tx)]);

        start(&cfg, &mut loader, Arc::clone(&pool), &channels, cancel.clone()).unwrap();
        assert_eq!(
            loader.attached,
            vec![(
                "sock:inet_sock_set_state".to_string(),
                "sk_trace0".to_string()
            )]
        );

        loader.inject("ipv4_events0", &5u32.to_le_bytes()).await;
        let buf = rx.recv().await.unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with(r#"{"RTT":5,"#));

        cancel.cancel();
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_restores_pool() {
        let mut cfg: Config = serde_yaml::from_str(
            r#"
tracepoints:
  - {name: "sock:inet_sock_set_state", fields: g, egress: e, inet: [4], workers: 1}
fields:
  g: [{name: rtt}]
egress:
  e: {type: console}
"#,
        )
        .unwrap();
        cfg.validate().unwrap();

        let mut loader = MockLoader::new();
        let pool = Arc::new(BufferPool::new());
        let cancel = CancellationToken::new();

        // capacity 1 and no consumer: the second record onward must drop
        let (tx, mut rx) = mpsc::channel(1);
        let channels = HashMap::from([("e".to_string(), tx)]);

        start(&cfg, &mut loader, Arc::clone(&pool), &channels, cancel.clone()).unwrap();

        for _ in 0..10 {
            loader.inject("ipv4_events0", &5u32.to_le_bytes()).await;
        }
        sleep(Duration::from_millis(100)).await;

        // one record buffered; the nine dropped records all gave their
        // buffer back (the single worker cycles one drop buffer)
        assert_eq!(pool.idle(), 1);
        let buffered = rx.try_recv().unwrap();
        assert!(buffered.starts_with(&b"{\"RTT\":5,"[..]));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_workers() {
        let cfg = test_config();
        let mut loader = MockLoader::new();
        let pool = Arc::new(BufferPool::new());
        let cancel = CancellationToken::new();

        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let channels = HashMap::from([("e".to_string(), tx)]);

        start(&cfg, &mut loader, Arc::clone(&pool), &channels, cancel.clone()).unwrap();
        cancel.cancel();
        sleep(Duration::from_millis(50)).await;

        // workers are gone; an injected record is never decoded
        loader.inject("ipv4_events0", &5u32.to_le_bytes()).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_reuses_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"data");
        pool.put(buf);
        assert_eq!(pool.idle(), 1);
        let buf = pool.get();
        assert_eq!(pool.idle(), 0);
        // contents survive until the worker clears them
        assert_eq!(&buf[..], b"data");
    }
}
