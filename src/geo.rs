//! Geo Module
//!
//! Coordinate values, location samples and the minimum-displacement filter.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for great-circle distances
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Great-circle distance to `other` in meters (haversine)
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// One update cycle's worth of position data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub coordinate: Coordinate,
    pub captured_at: DateTime<Utc>,
    pub address: Option<String>,
}

impl LocationSample {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            captured_at: Utc::now(),
            address: None,
        }
    }
}

/// Drops fixes that moved less than `min_displacement_m` from the last one let through.
///
/// The first fix always passes. A threshold of zero lets everything through.
#[derive(Debug, Clone)]
pub struct DisplacementFilter {
    min_displacement_m: f64,
    last: Option<Coordinate>,
}

impl DisplacementFilter {
    pub fn new(min_displacement_m: f64) -> Self {
        Self {
            min_displacement_m: min_displacement_m.max(0.0),
            last: None,
        }
    }

    /// Returns true if `coordinate` should be emitted, and remembers it if so
    pub fn accept(&mut self, coordinate: Coordinate) -> bool {
        let pass = match &self.last {
            None => true,
            Some(last) => last.distance_to(&coordinate) >= self.min_displacement_m,
        };
        if pass {
            self.last = Some(coordinate);
        }
        pass
    }
}

/// Formats a timestamp as `YYYY-MM-DD HH:mm:ss` in local time
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
