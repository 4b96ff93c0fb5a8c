//! Agent configuration: YAML schema, defaults and the validation pass that
//! canonicalizes field names and rejects anything the catalog does not know.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::fields;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("unknown tcp state: {0}")]
    UnknownState(String),
    #[error("unknown tracepoint: {0}")]
    UnknownTracepoint(String),
    #[error("fields group not found: {0}")]
    UnknownFieldsGroup(String),
    #[error("egress not found: {0}")]
    UnknownEgress(String),
    #[error("unknown egress type: {0}")]
    UnknownEgressType(String),
    #[error("invalid inet family: {0} (expected 4 or 6)")]
    InvalidInet(u8),
    #[error("invalid adapter config: {0}")]
    BadAdapterConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracepoints: Vec<Tracepoint>,
    #[serde(default)]
    pub fields: HashMap<String, Vec<FieldRef>>,
    #[serde(default)]
    pub egress: HashMap<String, EgressConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tracepoint {
    pub name: String,
    pub fields: String,
    #[serde(default = "default_tcp_state")]
    pub tcp_state: String,
    #[serde(default)]
    pub sample: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_inet")]
    pub inet: Vec<u8>,
    pub egress: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldRef {
    pub name: String,
    #[serde(default)]
    pub math: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_tcp_state() -> String {
    "TCP_CLOSE".to_string()
}
fn default_workers() -> usize {
    1
}
fn default_inet() -> Vec<u8> {
    vec![4]
}
fn default_log_level() -> String {
    "info".to_string()
}

const EGRESS_TYPES: [&str; 6] = ["console", "csv", "jsonl", "grpc", "grpc-spb", "kafka"];

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Canonicalizes and validates the whole configuration. Any failure here
    /// is fatal at startup.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for group in self.fields.values_mut() {
            for field in group.iter_mut() {
                let canonical = fields::resolve(&field.name)?;
                if let Some(filter) = &field.filter {
                    field.filter = Some(filter.replace(&field.name, canonical));
                }
                field.name = canonical.to_string();
            }
        }

        for tp in self.tracepoints.iter_mut() {
            fields::validate_tracepoint(&tp.name)?;
            tp.tcp_state = fields::validate_tcp_state(&tp.tcp_state)?;

            if !self.fields.contains_key(&tp.fields) {
                return Err(ConfigError::UnknownFieldsGroup(tp.fields.clone()));
            }

            for family in &tp.inet {
                if *family != 4 && *family != 6 {
                    return Err(ConfigError::InvalidInet(*family));
                }
            }

            match self.egress.get(&tp.egress) {
                None => return Err(ConfigError::UnknownEgress(tp.egress.clone())),
                Some(egress) if !EGRESS_TYPES.contains(&egress.kind.as_str()) => {
                    return Err(ConfigError::UnknownEgressType(egress.kind.clone()))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    /// Field names of a group, in declaration order.
    pub fn tp_field_names(&self, group: &str) -> Vec<String> {
        self.fields
            .get(group)
            .map(|fields| fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default()
    }
}

/// Re-deserializes a type-specific adapter option map into its typed config,
/// applying the type's serde defaults for missing keys.
pub fn transform<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T, ConfigError> {
    let value = match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other.clone(),
    };
    serde_yaml::from_value(value).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))
}

/// Installs the env_logger backend using the configured level.
pub fn init_logger(cfg: &LogConfig) {
    let _ = env_logger::Builder::new()
        .parse_filters(&cfg.level)
        .try_init();
}
