//! The polymorphic record carried on every flow channel, and helpers for
//! moving values out of each shape.

use serde_json::{Map, Value};

use tcpdog_common::columns::{self, ColumnValue};
use tcpdog_common::proto::{Fields, FieldsSpb};

/// A decoded agent record in one of the three wire serializations.
#[derive(Debug, Clone)]
pub enum Record {
    Json(Map<String, Value>),
    Pb(Fields),
    Spb(FieldsSpb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serialization {
    Json,
    Pb,
    Spb,
}

impl Serialization {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(Self::Json),
            "pb" => Some(Self::Pb),
            "spb" => Some(Self::Spb),
            _ => None,
        }
    }
}

impl Record {
    /// String value of a named field, if the record carries one. Used for
    /// geo lookups and tag extraction.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self {
            Record::Json(map) => map.get(name).and_then(Value::as_str).map(str::to_string),
            Record::Pb(fields) => {
                if name == "Hostname" {
                    return (!fields.hostname.is_empty()).then(|| fields.hostname.clone());
                }
                match columns::find(name).and_then(|col| (col.get)(fields)) {
                    Some(ColumnValue::Str(v)) => Some(v),
                    _ => None,
                }
            }
            Record::Spb(spb) => {
                let fields = spb.fields.as_ref()?;
                match fields.fields.get(name)?.kind.as_ref()? {
                    prost_types::value::Kind::StringValue(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    }

    /// Numeric value of a named field as u64, if the record carries one.
    pub fn get_num(&self, name: &str) -> Option<u64> {
        match self {
            Record::Json(map) => map.get(name).and_then(Value::as_u64),
            Record::Pb(fields) => {
                if name == "Timestamp" {
                    return fields.timestamp.map(|ts| ts as u64);
                }
                match columns::find(name).and_then(|col| (col.get)(fields)) {
                    Some(ColumnValue::U32(v)) => Some(u64::from(v)),
                    Some(ColumnValue::U64(v)) => Some(v),
                    _ => None,
                }
            }
            Record::Spb(spb) => {
                let fields = spb.fields.as_ref()?;
                match fields.fields.get(name)?.kind.as_ref()? {
                    prost_types::value::Kind::NumberValue(v) => Some(*v as u64),
                    _ => None,
                }
            }
        }
    }

    /// Unix-seconds timestamp of the record.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            Record::Json(map) => map.get("Timestamp").and_then(Value::as_i64),
            Record::Pb(fields) => fields.timestamp,
            Record::Spb(spb) => {
                let fields = spb.fields.as_ref()?;
                match fields.fields.get("Timestamp")?.kind.as_ref()? {
                    prost_types::value::Kind::NumberValue(v) => Some(*v as i64),
                    _ => None,
                }
            }
        }
    }
}
