//! BCC-backed loader: compiles the generated C at runtime and polls the perf
//! maps from a dedicated thread. Everything kernel-version-specific stays in
//! this file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bcc::perf_event::PerfMapBuilder;
use bcc::{Tracepoint, BPF};
use bytes::BytesMut;
use tokio::sync::mpsc;

use super::{Loader, LoaderError};

pub struct BccLoader {
    bpf: Option<BPF>,
    pending: Vec<(String, mpsc::Sender<BytesMut>)>,
    stop: Arc<AtomicBool>,
    poller: Option<std::thread::JoinHandle<()>>,
}

impl BccLoader {
    pub fn new() -> Self {
        Self {
            bpf: None,
            pending: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            poller: None,
        }
    }
}

impl Default for BccLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader for BccLoader {
    fn load(&mut self, source: &str) -> Result<(), LoaderError> {
        let bpf = BPF::new(source).map_err(|e| LoaderError::Load(e.to_string()))?;
        self.bpf = Some(bpf);
        Ok(())
    }

    fn attach_tracepoint(&mut self, tracepoint: &str, handler: &str) -> Result<(), LoaderError> {
        let bpf = self.bpf.as_mut().ok_or(LoaderError::Unavailable)?;

        let (subsystem, name) = tracepoint.split_once(':').ok_or_else(|| LoaderError::Attach {
            tracepoint: tracepoint.to_string(),
            reason: "expected subsystem:name".to_string(),
        })?;

        Tracepoint::new()
            .handler(handler)
            .subsystem(subsystem)
            .tracepoint(name)
            .attach(bpf)
            .map_err(|e| LoaderError::Attach {
                tracepoint: tracepoint.to_string(),
                reason: e.to_string(),
            })
    }

    fn open_perf_buffer(
        &mut self,
        table: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BytesMut>, LoaderError> {
        if self.bpf.is_none() {
            return Err(LoaderError::Unavailable);
        }

        let (tx, rx) = mpsc::channel(capacity);
        self.pending.push((table.to_string(), tx));
        Ok(rx)
    }

    fn start(&mut self) {
        let Some(bpf) = self.bpf.take() else {
            return;
        };
        let pending = std::mem::take(&mut self.pending);
        let stop = Arc::clone(&self.stop);

        // perf_map_poll services every map on the module, so one thread owns
        // the module for its whole life
        self.poller = Some(std::thread::spawn(move || {
            let mut maps = Vec::new();

            for (table_name, tx) in pending {
                let table = match bpf.table(&table_name) {
                    Ok(table) => table,
                    Err(e) => {
                        log::error!("perf table {table_name} unavailable: {e}");
                        continue;
                    }
                };

                let tx = tx.clone();
                let built = PerfMapBuilder::new(table, move || {
                    let tx = tx.clone();
                    Box::new(move |data: &[u8]| {
                        if tx.try_send(BytesMut::from(data)).is_err() {
                            log::warn!("perf channel maxed out");
                        }
                    })
                })
                .build();

                match built {
                    Ok(map) => maps.push(map),
                    Err(e) => log::error!("perf map init failed for {table_name}: {e}"),
                }
            }

            while !stop.load(Ordering::Relaxed) {
                for map in maps.iter_mut() {
                    map.poll(10);
                }
            }
            drop(bpf);
        }));
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        self.bpf = None;
    }
}
