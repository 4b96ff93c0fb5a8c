//! IP2Location BIN database provider. US state names are mapped to their
//! two-letter codes the way the location databases spell them.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ip2location::{Record, DB};

use super::Geoer;

pub struct Ip2Loc {
    // the reader seeks inside the BIN file per lookup
    db: Mutex<DB>,
    us_codes: HashMap<&'static str, &'static str>,
}

impl Ip2Loc {
    pub fn open(cfg: &HashMap<String, String>) -> anyhow::Result<Self> {
        let path = cfg
            .get("path")
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow::anyhow!("ip2loc requires path"))?;

        let db = DB::from_file(path)
            .map_err(|e| anyhow::anyhow!("ip2loc open {path} failed: {e:?}"))?;

        Ok(Self {
            db: Mutex::new(db),
            us_codes: us_codes(),
        })
    }
}

impl Geoer for Ip2Loc {
    fn get(&self, ip: &str) -> Option<HashMap<String, String>> {
        let ip: IpAddr = ip.parse().ok()?;

        let db = self.db.lock().ok()?;
        let record = match db.ip_lookup(ip) {
            Ok(record) => record,
            Err(e) => {
                log::error!("ip2loc lookup failed: {e:?}");
                return None;
            }
        };

        let Record::LocationDb(location) = record else {
            return None;
        };

        let mut out = HashMap::new();
        if let Some(country) = &location.country {
            out.insert("CCode".to_string(), country.short_name.to_string());
            out.insert("Country".to_string(), country.long_name.to_string());
        }
        if let Some(region) = &location.region {
            let region = region.to_string();
            if let Some(code) = self.us_codes.get(region.as_str()) {
                out.insert("CSCode".to_string(), (*code).to_string());
            }
            out.insert("Region".to_string(), region);
        }
        if let Some(city) = &location.city {
            out.insert("City".to_string(), city.to_string());
        }

        (!out.is_empty()).then_some(out)
    }
}

fn us_codes() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("Alabama", "AL"),
        ("Alaska", "AK"),
        ("Arizona", "AZ"),
        ("Arkansas", "AR"),
        ("California", "CA"),
        ("Colorado", "CO"),
        ("Connecticut", "CT"),
        ("Delaware", "DE"),
        ("District Of Columbia", "DC"),
        ("Florida", "FL"),
        ("Georgia", "GA"),
        ("Hawaii", "HI"),
        ("Idaho", "ID"),
        ("Illinois", "IL"),
        ("Indiana", "IN"),
        ("Iowa", "IA"),
        ("Kansas", "KS"),
        ("Kentucky", "KY"),
        ("Louisiana", "LA"),
        ("Maine", "ME"),
        ("Maryland", "MD"),
        ("Massachusetts", "MA"),
        ("Michigan", "MI"),
        ("Minnesota", "MN"),
        ("Mississippi", "MS"),
        ("Missouri", "MO"),
        ("Montana", "MT"),
        ("Nebraska", "NE"),
        ("Nevada", "NV"),
        ("New Hampshire", "NH"),
        ("New Jersey", "NJ"),
        ("New Mexico", "NM"),
        ("New York", "NY"),
        ("North Carolina", "NC"),
        ("North Dakota", "ND"),
        ("Ohio", "OH"),
        ("Oklahoma", "OK"),
        ("Oregon", "OR"),
        ("Pennsylvania", "PA"),
        ("Rhode Island", "RI"),
        ("South Carolina", "SC"),
        ("South Dakota", "SD"),
        ("Tennessee", "TN"),
        ("Texas", "TX"),
        ("Utah", "UT"),
        ("Vermont", "VT"),
        ("Virginia", "VA"),
        ("Washington", "WA"),
        ("West Virginia", "WV"),
        ("Wisconsin", "WI"),
        ("Wyoming", "WY"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_is_rejected() {
        assert!(Ip2Loc::open(&HashMap::new()).is_err());
    }

    #[test]
    fn state_codes_cover_dc() {
        let codes = us_codes();
        assert_eq!(codes["District Of Columbia"], "DC");
        assert_eq!(codes.len(), 51);
    }
}
