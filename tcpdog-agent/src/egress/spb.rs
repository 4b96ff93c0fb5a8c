//! JSON → `google.protobuf.Struct` conversion on the hot path. Exploits the
//! decoder's known key order instead of parsing JSON: string-valued fields
//! (Task, SAddr, DAddr) keep their text, everything else becomes a number.

use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::{Struct, Value};

use super::scan::FieldScan;

const STRING_FIELDS: [&str; 3] = ["Task", "SAddr", "DAddr"];

pub struct StructPb {
    scan: FieldScan,
    hostname: String,
}

impl StructPb {
    pub fn new(fields: &[String], hostname: String) -> Self {
        Self {
            scan: FieldScan::new(fields),
            hostname,
        }
    }

    /// Converts one decoder buffer into a struct value, injecting Hostname
    /// and Timestamp. Returns `None` on a layout mismatch.
    pub fn unmarshal(&self, data: &[u8]) -> Option<Struct> {
        let (values, ts) = self.scan.split(data)?;
        let mut fields = BTreeMap::new();

        for (name, raw) in self.scan.names().iter().zip(values) {
            let kind = if STRING_FIELDS.contains(&name.as_str()) {
                // quoted in the JSON; strip the quotes
                if raw.len() < 2 {
                    return None;
                }
                Kind::StringValue(String::from_utf8_lossy(&raw[1..raw.len() - 1]).into_owned())
            } else {
                let text = std::str::from_utf8(raw).ok()?;
                Kind::NumberValue(text.parse::<i64>().ok()? as f64)
            };

            fields.insert(name.clone(), Value { kind: Some(kind) });
        }

        let ts_text = std::str::from_utf8(ts).ok()?;
        fields.insert(
            "Timestamp".to_string(),
            Value {
                kind: Some(Kind::NumberValue(ts_text.parse::<i64>().ok()? as f64)),
            },
        );
        fields.insert(
            "Hostname".to_string(),
            Value {
                kind: Some(Kind::StringValue(self.hostname.clone())),
            },
        );

        Some(Struct { fields })
    }
}
