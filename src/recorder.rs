//! Beacon enrichment and persistence

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::db::{Database, RawEvent};
use crate::geoip::{GeoLocation, SharedGeoLookup};
use crate::identity::IdentityHasher;

/// A page view as delivered by the transport layer
#[derive(Debug, Clone, Default)]
pub struct Beacon {
    /// Client address, optionally with a `:port` suffix
    pub ip_address: String,
    pub user_agent: String,
    pub referrer: String,
    pub page_url: String,
}

#[derive(Clone)]
pub struct Recorder {
    db: Database,
    geoip: SharedGeoLookup,
    hasher: IdentityHasher,
}

impl Recorder {
    pub fn new(db: Database, geoip: SharedGeoLookup, hasher: IdentityHasher) -> Self {
        Self { db, geoip, hasher }
    }

    /// Append one enriched event. Geo failures degrade to empty location fields;
    /// only a failed insert is returned as an error.
    pub async fn record(&self, beacon: Beacon) -> Result<i64> {
        self.record_at(beacon, Utc::now()).await
    }

    pub(crate) async fn record_at(&self, beacon: Beacon, at: DateTime<Utc>) -> Result<i64> {
        let host = strip_port(&beacon.ip_address);

        let location = self.geoip.resolve_str(host).unwrap_or_else(|e| {
            debug!(error = %e, "GeoIP lookup failed, recording without location");
            GeoLocation::default()
        });

        let event = RawEvent::new(at, self.hasher.hash(host), beacon.page_url)
            .with_user_agent(beacon.user_agent)
            .with_referrer(beacon.referrer)
            .with_geo(location);

        self.db.insert_event(&event).await
    }
}

/// Drop a trailing `:port` from an address, leaving anything unparseable untouched
pub fn strip_port(address: &str) -> &str {
    if address.parse::<IpAddr>().is_ok() {
        return address;
    }
    if address.parse::<SocketAddr>().is_ok() {
        if let Some((host, _)) = address.rsplit_once(':') {
            return host.trim_start_matches('[').trim_end_matches(']');
        }
    }
    match address.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !host.contains(':')
                && !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit()) =>
        {
            host
        }
        _ => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::{GeoError, GeoLookup};
    use std::sync::Arc;

    struct FixedGeo(Option<GeoLocation>);

    impl GeoLookup for FixedGeo {
        fn resolve(&self, _ip: IpAddr) -> Result<GeoLocation, GeoError> {
            self.0.clone().ok_or(GeoError::Unavailable)
        }
    }

    fn paris() -> GeoLocation {
        GeoLocation {
            city: Some("Paris".into()),
            region: Some("Île-de-France".into()),
            country: Some("France".into()),
        }
    }

    async fn recorder(geo: FixedGeo) -> (Database, Recorder) {
        let db = Database::in_memory().await.unwrap();
        let recorder = Recorder::new(db.clone(), Arc::new(geo), IdentityHasher::new("test-salt"));
        (db, recorder)
    }

    fn beacon(ip: &str) -> Beacon {
        Beacon {
            ip_address: ip.into(),
            user_agent: "Mozilla/5.0".into(),
            referrer: "https://ref.com/".into(),
            page_url: "/a".into(),
        }
    }

    #[test]
    fn strips_ports() {
        assert_eq!(strip_port("203.0.113.7:5000"), "203.0.113.7");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("203.0.113.7"), "203.0.113.7");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
        assert_eq!(strip_port("garbage"), "garbage");
        assert_eq!(strip_port(""), "");
    }

    #[tokio::test]
    async fn records_enriched_event_without_raw_ip() {
        let (db, recorder) = recorder(FixedGeo(Some(paris()))).await;
        let id = recorder.record(beacon("203.0.113.7:5000")).await.unwrap();

        let event = db.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.hashed_ip, IdentityHasher::new("test-salt").hash("203.0.113.7"));
        assert!(!event.hashed_ip.contains("203.0.113.7"));
        assert_eq!(event.user_agent, "Mozilla/5.0");
        assert_eq!(event.referrer, "https://ref.com/");
        assert_eq!(event.page_url, "/a");
        assert_eq!(event.geo_city, "Paris");
        assert_eq!(event.geo_region, "Île-de-France");
        assert_eq!(event.geo_country, "France");
    }

    #[tokio::test]
    async fn geo_failure_still_records() {
        let (db, recorder) = recorder(FixedGeo(None)).await;
        let id = recorder.record(beacon("203.0.113.7")).await.unwrap();

        let event = db.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.geo_city, "");
        assert_eq!(event.geo_region, "");
        assert_eq!(event.geo_country, "");
    }

    #[tokio::test]
    async fn unparseable_address_is_hashed_as_is() {
        let (db, recorder) = recorder(FixedGeo(Some(paris()))).await;
        let id = recorder.record(beacon("unknown")).await.unwrap();

        let event = db.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.hashed_ip, IdentityHasher::new("test-salt").hash("unknown"));
        // Never reaches the resolver
        assert_eq!(event.geo_city, "");
    }

    #[tokio::test]
    async fn same_client_gets_same_token_regardless_of_port() {
        let (db, recorder) = recorder(FixedGeo(None)).await;
        let first = recorder.record(beacon("203.0.113.7:1111")).await.unwrap();
        let second = recorder.record(beacon("203.0.113.7:2222")).await.unwrap();

        let first = db.get_event(first).await.unwrap().unwrap();
        let second = db.get_event(second).await.unwrap().unwrap();
        assert_eq!(first.hashed_ip, second.hashed_ip);
    }

    #[tokio::test]
    async fn record_at_keeps_second_precision() {
        let (db, recorder) = recorder(FixedGeo(None)).await;
        let at = DateTime::from_timestamp(1_700_000_000, 987_654_321).unwrap();
        let id = recorder.record_at(beacon("203.0.113.7"), at).await.unwrap();

        let event = db.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(db.count_events_on(at.date_naive()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn storage_failure_is_surfaced() {
        let (db, recorder) = recorder(FixedGeo(None)).await;
        db.close().await;
        assert!(recorder.record(beacon("203.0.113.7")).await.is_err());
    }
}
