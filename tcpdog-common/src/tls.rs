//! TLS material shared by the gRPC and Kafka adapters.

use std::fs;
use std::io;

use serde::Deserialize;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// TLS options as they appear in adapter `config` maps. The core only loads
/// and passes the material; trust decisions belong to the transports.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default, alias = "tls-enabled")]
    pub enable: bool,
    #[serde(default, alias = "tls-cert")]
    pub cert: Option<String>,
    #[serde(default, alias = "tls-key")]
    pub key: Option<String>,
    #[serde(default, alias = "ca-file")]
    pub ca: Option<String>,
    #[serde(default, alias = "tls-skip-verify")]
    pub insecure_skip_verify: bool,
}

impl TlsConfig {
    /// Builds the tonic client-side TLS configuration.
    pub fn client(&self) -> io::Result<ClientTlsConfig> {
        let mut tls = ClientTlsConfig::new();

        if let Some(ca) = &self.ca {
            tls = tls.ca_certificate(Certificate::from_pem(fs::read(ca)?));
        }

        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            tls = tls.identity(Identity::from_pem(fs::read(cert)?, fs::read(key)?));
        }

        Ok(tls)
    }

    /// Builds the tonic server-side TLS configuration; the identity is
    /// mandatory on the server.
    pub fn server(&self) -> io::Result<ServerTlsConfig> {
        let (cert, key) = match (&self.cert, &self.key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "tls enabled but cert/key not configured",
                ))
            }
        };

        let mut tls =
            ServerTlsConfig::new().identity(Identity::from_pem(fs::read(cert)?, fs::read(key)?));

        if let Some(ca) = &self.ca {
            tls = tls.client_ca_root(Certificate::from_pem(fs::read(ca)?));
        }

        Ok(tls)
    }
}
