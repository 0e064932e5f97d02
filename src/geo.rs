use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Geolocation attached to a flow at finalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<i64>,
}

/// Pure address-to-location lookup.
///
/// The actual GeoIP database integration lives outside the core; the engine
/// only depends on this contract.
pub trait GeoLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;
}

/// Default backend that resolves nothing.
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_geo_resolves_nothing() {
        let geo = NoGeo;
        assert_eq!(geo.lookup("8.8.8.8".parse().unwrap()), None);
        assert_eq!(geo.lookup("::1".parse().unwrap()), None);
    }
}
