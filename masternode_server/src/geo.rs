//! IP geolocation
//!
//! Resolves an IP address to approximate coordinates. Lookups can be
//! administratively disabled, in which case every address sits at (0, 0).

use maxminddb::geoip2;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("Failed to open GeoIP database: {0}")]
    Open(maxminddb::MaxMindDBError),

    #[error("GeoIP lookup failed for {0}: {1}")]
    Lookup(IpAddr, maxminddb::MaxMindDBError),

    #[error("No location known for {0}")]
    NoLocation(IpAddr),
}

/// A point on the globe in degrees
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinate {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }

    /// Earth-centred cartesian position in kilometres
    pub fn to_cartesian(&self) -> [f64; 3] {
        let lat = self.latitude.to_radians();
        let long = self.longitude.to_radians();
        [
            EARTH_RADIUS_KM * lat.cos() * long.cos(),
            EARTH_RADIUS_KM * lat.cos() * long.sin(),
            EARTH_RADIUS_KM * lat.sin(),
        ]
    }

    /// Great-circle distance (haversine)
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_long = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_long / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// IP to coordinate resolver
pub enum GeoIp {
    /// Lookups disabled; every address resolves to (0, 0)
    Disabled,
    /// MaxMind City database
    MaxMind(maxminddb::Reader<Vec<u8>>),
    /// Explicit address table
    Fixed(HashMap<IpAddr, Coordinate>),
}

impl GeoIp {
    /// Open a MaxMind City database
    pub fn open(path: &Path) -> Result<Self, GeoError> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(GeoError::Open)?;
        Ok(GeoIp::MaxMind(reader))
    }

    pub fn fixed<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (IpAddr, Coordinate)>,
    {
        GeoIp::Fixed(entries.into_iter().collect())
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, GeoIp::Disabled)
    }

    /// Resolve an address to its approximate (longitude, latitude)
    pub fn resolve(&self, ip: IpAddr) -> Result<Coordinate, GeoError> {
        match self {
            GeoIp::Disabled => Ok(Coordinate::default()),
            GeoIp::MaxMind(reader) => {
                let city: geoip2::City = reader
                    .lookup(ip)
                    .map_err(|e| GeoError::Lookup(ip, e))?;
                let location = city.location.ok_or(GeoError::NoLocation(ip))?;
                match (location.longitude, location.latitude) {
                    (Some(longitude), Some(latitude)) => Ok(Coordinate::new(longitude, latitude)),
                    _ => Err(GeoError::NoLocation(ip)),
                }
            }
            GeoIp::Fixed(table) => table.get(&ip).copied().ok_or(GeoError::NoLocation(ip)),
        }
    }
}

impl std::fmt::Debug for GeoIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeoIp::Disabled => f.write_str("GeoIp::Disabled"),
            GeoIp::MaxMind(_) => f.write_str("GeoIp::MaxMind"),
            GeoIp::Fixed(table) => write!(f, "GeoIp::Fixed({} entries)", table.len()),
        }
    }
}
