//! MaxMind GeoIP2 provider. The `level` option selects how much detail is
//! attached per lookup: asn, city, city-asn, city-loc or city-loc-asn.

use std::collections::HashMap;
use std::net::IpAddr;

use maxminddb::{geoip2, Reader};

use super::Geoer;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Level {
    Asn,
    City,
    CityAsn,
    CityLoc,
    CityLocAsn,
}

impl Level {
    fn parse(level: &str) -> Option<Self> {
        match level.to_lowercase().as_str() {
            "asn" => Some(Self::Asn),
            "city" => Some(Self::City),
            "city-asn" => Some(Self::CityAsn),
            "city-loc" => Some(Self::CityLoc),
            "city-loc-asn" => Some(Self::CityLocAsn),
            _ => None,
        }
    }

    fn wants_city(self) -> bool {
        !matches!(self, Self::Asn)
    }

    fn wants_loc(self) -> bool {
        matches!(self, Self::CityLoc | Self::CityLocAsn)
    }

    fn wants_asn(self) -> bool {
        matches!(self, Self::Asn | Self::CityAsn | Self::CityLocAsn)
    }
}

pub struct Maxmind {
    city_db: Option<Reader<Vec<u8>>>,
    asn_db: Option<Reader<Vec<u8>>>,
    level: Level,
}

impl Maxmind {
    pub fn open(cfg: &HashMap<String, String>) -> anyhow::Result<Self> {
        let level = cfg
            .get("level")
            .map(String::as_str)
            .unwrap_or("city-loc-asn");
        let level =
            Level::parse(level).ok_or_else(|| anyhow::anyhow!("unknown maxmind level: {level}"))?;

        let city_db = match cfg.get("path-city") {
            Some(path) if !path.is_empty() => Some(Reader::open_readfile(path)?),
            _ => None,
        };
        let asn_db = match cfg.get("path-asn") {
            Some(path) if !path.is_empty() => Some(Reader::open_readfile(path)?),
            _ => None,
        };

        if level.wants_city() && city_db.is_none() {
            anyhow::bail!("maxmind level requires path-city");
        }
        if level.wants_asn() && asn_db.is_none() {
            anyhow::bail!("maxmind level requires path-asn");
        }

        Ok(Self {
            city_db,
            asn_db,
            level,
        })
    }

    fn city(&self, ip: IpAddr, out: &mut HashMap<String, String>) {
        let Some(db) = &self.city_db else { return };
        let record: geoip2::City = match db.lookup(ip) {
            Ok(record) => record,
            Err(e) => {
                log::error!("maxmind city lookup failed: {e}");
                return;
            }
        };

        if let Some(country) = &record.country {
            if let Some(code) = country.iso_code {
                out.insert("CCode".to_string(), code.to_string());
            }
            if let Some(name) = country.names.as_ref().and_then(|names| names.get("en")) {
                out.insert("Country".to_string(), name.to_string());
            }
        }
        if let Some(name) = record
            .city
            .as_ref()
            .and_then(|city| city.names.as_ref())
            .and_then(|names| names.get("en"))
        {
            out.insert("City".to_string(), name.to_string());
        }
        if let Some(subdivision) = record
            .subdivisions
            .as_ref()
            .and_then(|subdivisions| subdivisions.first())
        {
            if let Some(code) = subdivision.iso_code {
                out.insert("CSCode".to_string(), code.to_string());
            }
            if let Some(name) = subdivision.names.as_ref().and_then(|names| names.get("en")) {
                out.insert("Region".to_string(), name.to_string());
            }
        }

        if self.level.wants_loc() {
            if let Some(location) = &record.location {
                if let (Some(lat), Some(lon)) = (location.latitude, location.longitude) {
                    out.insert("GeoLocation".to_string(), format!("{lat:.6},{lon:.6}"));
                }
            }
        }
    }

    fn asn(&self, ip: IpAddr, out: &mut HashMap<String, String>) {
        let Some(db) = &self.asn_db else { return };
        let record: geoip2::Asn = match db.lookup(ip) {
            Ok(record) => record,
            Err(e) => {
                log::error!("maxmind asn lookup failed: {e}");
                return;
            }
        };

        if let Some(number) = record.autonomous_system_number {
            out.insert("ASN".to_string(), number.to_string());
        }
        if let Some(org) = record.autonomous_system_organization {
            out.insert("ASNOrg".to_string(), org.to_string());
        }
    }
}

impl Geoer for Maxmind {
    fn get(&self, ip: &str) -> Option<HashMap<String, String>> {
        let ip: IpAddr = ip.parse().ok()?;
        let mut out = HashMap::new();

        if self.level.wants_city() {
            self.city(ip, &mut out);
        }
        if self.level.wants_asn() {
            self.asn(ip, &mut out);
        }

        (!out.is_empty()).then_some(out)
    }
}
