//! TCPDog server: receives records from remote agents over gRPC or Kafka,
//! optionally enriches them with IP geolocation, and writes them to a
//! time-series or search store.

pub mod cli;
pub mod config;
pub mod flow;
pub mod geo;
pub mod ingestion;
pub mod ingress;
pub mod record;
