//! Console egress: one line per record on stdout.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::BufferPool;

pub fn start(pool: Arc<BufferPool>, mut rx: mpsc::Receiver<BytesMut>, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let buf = tokio::select! {
                _ = cancel.cancelled() => return,
                buf = rx.recv() => match buf {
                    Some(buf) => buf,
                    None => return,
                },
            };

            println!("{}", String::from_utf8_lossy(&buf));
            pool.put(buf);
        }
    });
}
