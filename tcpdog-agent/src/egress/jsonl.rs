//! JSONL egress: one JSON array per line, values in field order with the
//! timestamp last. A header line names the columns.

use std::sync::Arc;

use bytes::BytesMut;
use serde::Deserialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{self, ConfigError};
use crate::dispatch::BufferPool;

use super::scan::FieldScan;

#[derive(Debug, Deserialize)]
pub struct JsonlConfig {
    pub filename: String,
}

pub async fn start(
    options: &serde_yaml::Value,
    fields: &[String],
    pool: Arc<BufferPool>,
    mut rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: JsonlConfig = config::transform(options)?;
    let scan = FieldScan::new(fields);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.filename)
        .await?;

    let header = format!("[{},timestamp]\n", fields.join(","));
    file.write_all(header.as_bytes()).await?;

    tokio::spawn(async move {
        let mut line = Vec::with_capacity(256);

        loop {
            let buf = tokio::select! {
                _ = cancel.cancelled() => return,
                buf = rx.recv() => match buf {
                    Some(buf) => buf,
                    None => return,
                },
            };

            if let Some((values, ts)) = scan.split(&buf) {
                line.clear();
                line.push(b'[');
                for value in values {
                    line.extend_from_slice(value);
                    line.push(b',');
                }
                line.extend_from_slice(ts);
                line.extend_from_slice(b"]\n");

                if let Err(e) = file.write_all(&line).await {
                    log::error!("jsonl write failed: {e}");
                }
            } else {
                log::warn!("jsonl: record layout mismatch");
            }

            pool.put(buf);
        }
    });

    Ok(())
}
