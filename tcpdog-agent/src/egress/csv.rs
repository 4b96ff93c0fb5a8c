//! CSV egress: a header row of field names, then one comma-separated row per
//! record, extracted from the decoder output by the key-skip scan.

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
pub struct CsvConfig {
    pub filename: String,
}

pub async fn start(
    options: &serde_yaml::Value,
    fields: &[String],
    pool: Arc<BufferPool>,
    mut rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> Result<(), ConfigError> {
    let cfg: CsvConfig = config::transform(options)?;
    let scan = FieldScan::new(fields);

    // open errors surface at start; write errors are only logged
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.filename)
        .await?;

    let mut header = fields.join(",");
    header.push_str(",timestamp\n");
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
                for value in values {
                    line.extend_from_slice(value);
                    line.push(b',');
                }
                line.extend_from_slice(ts);
                line.push(b'\n');

                if let Err(e) = file.write_all(&line).await {
                    log::error!("csv write failed: {e}");
                }
            } else {
                log::warn!("csv: record layout mismatch");
            }

            pool.put(buf);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let options = serde_yaml::to_value(serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::from("filename"),
            serde_yaml::Value::from(path.to_str().unwrap()),
        )]))
        .unwrap();

        let fields = vec!["RTT".to_string(), "SAddr".to_string()];
        let pool = Arc::new(BufferPool::new());
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        start(&options, &fields, Arc::clone(&pool), rx, cancel.clone())
            .await
            .unwrap();

        tx.send(BytesMut::from(
            &br#"{"RTT":5,"SAddr":"10.0.0.1","Timestamp":1700000000}"#[..],
        ))
        .await
        .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        cancel.cancel();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("RTT,SAddr,timestamp"));
        assert_eq!(lines.next(), Some(r#"5,"10.0.0.1",1700000000"#));
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn missing_filename_fails_at_start() {
        let pool = Arc::new(BufferPool::new());
        let (_tx, rx) = mpsc::channel(1);
        let result = start(
            &serde_yaml::Value::Null,
            &[],
            pool,
            rx,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
