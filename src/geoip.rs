//! GeoIP lookup module using MaxMind GeoLite2 database

use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Coarse location of a client. Each level is empty when the database has no data for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geoip database not loaded")]
    Unavailable,

    #[error("invalid ip address: {0}")]
    InvalidAddress(String),

    #[error("geoip lookup failed: {0}")]
    Lookup(#[from] MaxMindDBError),
}

/// Resolves an address to a location
pub trait GeoLookup: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Result<GeoLocation, GeoError>;

    /// Parse then resolve; anything that is not a bare IP is rejected
    fn resolve_str(&self, ip: &str) -> Result<GeoLocation, GeoError> {
        let ip_addr: IpAddr = ip
            .parse()
            .map_err(|_| GeoError::InvalidAddress(ip.to_string()))?;
        self.resolve(ip_addr)
    }
}

/// GeoIP reader wrapper
pub struct GeoIp {
    reader: Option<Reader<Vec<u8>>>,
}

impl GeoIp {
    /// Create a new GeoIP instance, loading the database if available
    pub fn new(database_path: &str) -> Self {
        let path = Path::new(database_path);

        if !path.exists() {
            warn!("GeoIP database not found at: {}", database_path);
            warn!(
                "Download GeoLite2-City.mmdb from MaxMind and place it at: {}",
                database_path
            );
            return Self::disabled();
        }

        match Reader::open_readfile(path) {
            Ok(reader) => {
                info!("GeoIP database loaded: {}", database_path);
                Self {
                    reader: Some(reader),
                }
            }
            Err(e) => {
                warn!("Failed to load GeoIP database: {}", e);
                Self::disabled()
            }
        }
    }

    /// A resolver without a database; every lookup reports `Unavailable`
    pub fn disabled() -> Self {
        Self { reader: None }
    }

    /// Check if the GeoIP database is loaded
    pub fn is_available(&self) -> bool {
        self.reader.is_some()
    }
}

impl GeoLookup for GeoIp {
    fn resolve(&self, ip: IpAddr) -> Result<GeoLocation, GeoError> {
        let reader = self.reader.as_ref().ok_or(GeoError::Unavailable)?;

        // Never in the database
        if is_private_ip(&ip) {
            return Ok(GeoLocation::default());
        }

        let city: geoip2::City = match reader.lookup(ip) {
            Ok(city) => city,
            Err(MaxMindDBError::AddressNotFoundError(_)) => return Ok(GeoLocation::default()),
            Err(e) => return Err(e.into()),
        };

        Ok(GeoLocation {
            city: city
                .city
                .as_ref()
                .and_then(|c| english_name(c.names.as_ref())),
            region: city
                .subdivisions
                .as_ref()
                .and_then(|subs| subs.first())
                .and_then(|sub| english_name(sub.names.as_ref())),
            country: city
                .country
                .as_ref()
                .and_then(|c| english_name(c.names.as_ref())),
        })
    }
}

fn english_name(names: Option<&BTreeMap<&str, &str>>) -> Option<String> {
    names
        .and_then(|names| names.get("en"))
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}

/// Thread-safe resolver handle
pub type SharedGeoLookup = Arc<dyn GeoLookup>;
