//! Server configuration: named ingresses and ingestions, the flows pairing
//! them, and the optional geo provider.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::record::Serialization;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ingress not found: {0}")]
    UnknownIngress(String),
    #[error("ingestion not found: {0}")]
    UnknownIngestion(String),
    #[error("unknown ingress type: {0}")]
    UnknownIngressType(String),
    #[error("unknown ingestion type: {0}")]
    UnknownIngestionType(String),
    #[error("unknown serialization: {0}")]
    UnknownSerialization(String),
    #[error("unknown geo type: {0}")]
    UnknownGeoType(String),
    #[error("invalid adapter config: {0}")]
    BadAdapterConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub ingress: HashMap<String, Ingress>,
    #[serde(default)]
    pub ingestion: HashMap<String, Ingestion>,
    #[serde(default)]
    pub flow: Vec<Flow>,
    #[serde(default)]
    pub geo: Option<Geo>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingress {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ingestion {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flow {
    pub ingress: String,
    pub ingestion: String,
    #[serde(default = "default_serialization")]
    pub serialization: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
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

fn default_serialization() -> String {
    "json".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

const INGRESS_TYPES: [&str; 2] = ["grpc", "kafka"];
const INGESTION_TYPES: [&str; 3] = ["influxdb", "elasticsearch", "clickhouse"];
const GEO_TYPES: [&str; 2] = ["maxmind", "ip2loc"];

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for flow in &self.flow {
            match self.ingress.get(&flow.ingress) {
                None => return Err(ConfigError::UnknownIngress(flow.ingress.clone())),
                Some(ingress) if !INGRESS_TYPES.contains(&ingress.kind.as_str()) => {
                    return Err(ConfigError::UnknownIngressType(ingress.kind.clone()))
                }
                Some(_) => {}
            }

            match self.ingestion.get(&flow.ingestion) {
                None => return Err(ConfigError::UnknownIngestion(flow.ingestion.clone())),
                Some(ingestion) if !INGESTION_TYPES.contains(&ingestion.kind.as_str()) => {
                    return Err(ConfigError::UnknownIngestionType(ingestion.kind.clone()))
                }
                Some(_) => {}
            }

            Serialization::parse(&flow.serialization)
                .ok_or_else(|| ConfigError::UnknownSerialization(flow.serialization.clone()))?;
        }

        if let Some(geo) = &mut self.geo {
            if !GEO_TYPES.contains(&geo.kind.as_str()) {
                return Err(ConfigError::UnknownGeoType(geo.kind.clone()));
            }
            if geo.kind == "maxmind" && !geo.config.contains_key("level") {
                geo.config
                    .insert("level".to_string(), "city-loc-asn".to_string());
            }
        }

        Ok(())
    }
}

/// Re-deserializes a type-specific adapter option map into its typed config.
pub fn transform<T: DeserializeOwned>(value: &serde_yaml::Value) -> Result<T, ConfigError> {
    let value = match value {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other.clone(),
    };
    serde_yaml::from_value(value).map_err(|e| ConfigError::BadAdapterConfig(e.to_string()))
}

pub fn init_logger(cfg: &LogConfig) {
    let _ = env_logger::Builder::new()
        .parse_filters(&cfg.level)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
ingress:
  ingress01: {type: grpc, config: {addr: "0.0.0.0:8085"}}
  ingress02: {type: kafka, config: {brokers: ["localhost:9092"]}}
ingestion:
  influxdb01: {type: influxdb, config: {url: "http://localhost:8086"}}
flow:
  - {ingress: ingress01, ingestion: influxdb01, serialization: spb}
geo:
  type: maxmind
  config: {path-city: "/usr/share/GeoLite2-City.mmdb"}
log:
  level: warn
"#
    }

    #[test]
    fn parse_and_validate() {
        let mut cfg: ServerConfig = serde_yaml::from_str(sample()).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.flow.len(), 1);
        assert_eq!(cfg.flow[0].serialization, "spb");
        // maxmind level default is injected
        assert_eq!(
            cfg.geo.as_ref().unwrap().config.get("level").unwrap(),
            "city-loc-asn"
        );
        assert_eq!(cfg.log.level, "warn");
    }

    #[test]
    fn flow_with_unknown_ingress() {
        let yaml = r#"
ingress:
  a: {type: grpc}
ingestion:
  b: {type: influxdb}
flow:
  - {ingress: missing, ingestion: b}
"#;
        let mut cfg: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownIngress(_))
        ));
    }

    #[test]
    fn flow_with_bad_serialization() {
        let yaml = r#"
ingress:
  a: {type: grpc}
ingestion:
  b: {type: influxdb}
flow:
  - {ingress: a, ingestion: b, serialization: xml}
"#;
        let mut cfg: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownSerialization(_))
        ));
    }

    #[test]
    fn unknown_geo_type() {
        let yaml = r#"
geo: {type: starmap}
"#;
        let mut cfg: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::UnknownGeoType(_))));
    }

    #[test]
    fn serialization_defaults_to_json() {
        let yaml = r#"
ingress:
  a: {type: grpc}
ingestion:
  b: {type: elasticsearch}
flow:
  - {ingress: a, ingestion: b}
"#;
        let mut cfg: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.flow[0].serialization, "json");
    }
}
