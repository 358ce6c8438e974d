//! Geolocation payloads of registration responses.

use crate::error::ValidationError;

/// Mean Earth radius used for distances.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle (haversine) distance in meters.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}

/// Parse a `"<lat>|<lon>[|...]"` payload.
///
/// Trailing parts (elevation, accuracy) are ignored.
pub fn parse_geolocation(payload: &str) -> Result<GeoPoint, ValidationError> {
    let mut parts = payload.split('|');
    let (lat, lon) = match (parts.next(), parts.next()) {
        (Some(lat), Some(lon)) if !lat.trim().is_empty() && !lon.trim().is_empty() => (lat, lon),
        _ => return Err(ValidationError::MalformedGeolocation(payload.to_string())),
    };

    Ok(GeoPoint {
        latitude: parse_coordinate(lat, 90.0)?,
        longitude: parse_coordinate(lon, 180.0)?,
    })
}

fn parse_coordinate(raw: &str, bound: f64) -> Result<f64, ValidationError> {
    let invalid = || ValidationError::InvalidCoordinate {
        value: raw.to_string(),
    };
    let value: f64 = raw.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value.abs() > bound {
        return Err(invalid());
    }
    Ok(value)
}
