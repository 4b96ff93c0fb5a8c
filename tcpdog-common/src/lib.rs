//! Shared wire types and utilities for the TCPDog agent and server.

pub mod backoff;
pub mod columns;
pub mod tls;

pub use backoff::Backoff;

/// Generated gRPC service and message types.
pub mod proto {
    tonic::include_proto!("tcpdog");
}
