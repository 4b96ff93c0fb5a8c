//! Egress adapters: each consumes decoded buffers from one channel, ships
//! them somewhere, and returns the buffers to the pool.

use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tcpdog_common::columns::{self, ColumnKind, ColumnValue};
use tcpdog_common::proto::Fields;

use crate::config::{Config, Tracepoint};
use crate::dispatch::BufferPool;

pub mod console;
pub mod csv;
pub mod grpc;
pub mod jsonl;
pub mod kafka;
pub mod scan;
pub mod spb;

/// Starts the adapter configured under the tracepoint's egress name. The
/// adapter owns the channel receiver; producers fan in on the sender side.
pub async fn start(
    cfg: &Config,
    tp: &Tracepoint,
    pool: Arc<BufferPool>,
    rx: mpsc::Receiver<BytesMut>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let Some(egress) = cfg.egress.get(&tp.egress) else {
        bail!("egress not found: {}", tp.egress);
    };
    let fields = cfg.tp_field_names(&tp.fields);

    match egress.kind.as_str() {
        "console" => console::start(pool, rx, cancel),
        "csv" => csv::start(&egress.config, &fields, pool, rx, cancel).await?,
        "jsonl" => jsonl::start(&egress.config, &fields, pool, rx, cancel).await?,
        "grpc" => grpc::start(&egress.config, pool, rx, cancel)?,
        "grpc-spb" => grpc::start_structpb(&egress.config, &fields, pool, rx, cancel)?,
        "kafka" => kafka::start(&egress.config, &fields, pool, rx, cancel)?,
        other => bail!("unknown egress type: {other}"),
    }

    Ok(())
}

/// Maps a decoded JSON record onto the scalar `Fields` message through the
/// column table.
pub fn fields_from_json(map: &serde_json::Map<String, Value>, hostname: &str) -> Fields {
    let mut out = Fields {
        hostname: hostname.to_string(),
        ..Default::default()
    };

    for (key, value) in map {
        if key == "Timestamp" {
            out.timestamp = value.as_i64();
            continue;
        }
        if key == "Hostname" {
            continue;
        }

        let Some(col) = columns::find(key) else {
            continue;
        };
        match col.kind {
            ColumnKind::U32 => {
                if let Some(v) = value.as_u64() {
                    (col.set)(&mut out, ColumnValue::U32(v as u32));
                }
            }
            ColumnKind::U64 => {
                if let Some(v) = value.as_u64() {
                    (col.set)(&mut out, ColumnValue::U64(v));
                }
            }
            ColumnKind::Str => {
                if let Some(v) = value.as_str() {
                    (col.set)(&mut out, ColumnValue::Str(v.to_string()));
                }
            }
        }
    }

    out
}

pub(crate) fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_record_maps_onto_fields() {
        let record: Value = serde_json::from_str(
            r#"{"RTT":5,"BytesSent":900,"SAddr":"10.0.0.1","Timestamp":1700000000}"#,
        )
        .unwrap();
        let fields = fields_from_json(record.as_object().unwrap(), "host1");

        assert_eq!(fields.rtt, Some(5));
        assert_eq!(fields.bytes_sent, Some(900));
        assert_eq!(fields.saddr.as_deref(), Some("10.0.0.1"));
        assert_eq!(fields.timestamp, Some(1700000000));
        assert_eq!(fields.hostname, "host1");
        assert_eq!(fields.dport, None);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let record: Value =
            serde_json::from_str(r#"{"Mystery":1,"RTT":2,"Timestamp":3}"#).unwrap();
        let fields = fields_from_json(record.as_object().unwrap(), "");
        assert_eq!(fields.rtt, Some(2));
    }
}
