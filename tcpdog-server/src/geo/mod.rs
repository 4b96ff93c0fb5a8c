//! Pluggable IP geolocation. Providers are stateless lookups selected once
//! from `geo.type`; the returned attribute map is merged into records as
//! tags or document fields by the ingestion adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Geo;

pub mod ip2loc;
pub mod maxmind;

pub trait Geoer: Send + Sync {
    /// Geo attributes for an IP address string, or `None` when the address
    /// cannot be resolved.
    fn get(&self, ip: &str) -> Option<HashMap<String, String>>;
}

/// Builds the configured provider, if any. Missing database paths or an
/// unknown level are startup errors.
pub fn from_config(geo: Option<&Geo>) -> anyhow::Result<Option<Arc<dyn Geoer>>> {
    let Some(geo) = geo else {
        return Ok(None);
    };

    let provider: Arc<dyn Geoer> = match geo.kind.as_str() {
        "maxmind" => Arc::new(maxmind::Maxmind::open(&geo.config)?),
        "ip2loc" => Arc::new(ip2loc::Ip2Loc::open(&geo.config)?),
        other => anyhow::bail!("unknown geo type: {other}"),
    };

    Ok(Some(provider))
}
