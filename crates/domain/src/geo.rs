//! Geofence math: geohash decoding and great-circle distance.
//!
//! Pure and deterministic. Raw coordinates exist only transiently inside
//! this module; everything upstream and downstream handles geohash strings
//! and derived distances.

use thiserror::Error;

use crate::model::Geohash;

/// Mean earth radius in meters (spherical model).
const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoError {
    #[error("failed to decode geohash: {0}")]
    Decode(String),
}

/// Result of a single geofence evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofenceCheck {
    pub distance_m: f64,
    pub within_radius: bool,
    /// The accuracy margin that was actually applied (already capped).
    pub applied_margin_m: f64,
}

/// Geofence policy knobs, passed explicitly per call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeofencePolicy {
    /// Cap on the reported GPS accuracy that may widen the fence. A spoofed
    /// huge accuracy value never widens acceptance beyond this.
    pub max_accuracy_m: f64,
}

impl Default for GeofencePolicy {
    fn default() -> Self {
        Self { max_accuracy_m: 50.0 }
    }
}

/// Haversine great-circle distance between two lat/lng points, in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Decodes a validated geohash to its cell-centre lat/lng.
fn decode_center(hash: &Geohash) -> Result<(f64, f64), GeoError> {
    let (coord, _, _) = geohash::decode(hash.as_str())
        .map_err(|err| GeoError::Decode(err.to_string()))?;
    Ok((coord.y, coord.x))
}

/// Distance in meters between the centres of two geohash cells.
pub fn geohash_distance_m(a: &Geohash, b: &Geohash) -> Result<f64, GeoError> {
    let (lat_a, lon_a) = decode_center(a)?;
    let (lat_b, lon_b) = decode_center(b)?;
    Ok(haversine_m(lat_a, lon_a, lat_b, lon_b))
}

/// Evaluates the geofence: `within_radius = distance <= radius + margin`
/// with `margin = min(reported_accuracy, policy.max_accuracy_m)`.
pub fn check_geofence(
    place: &Geohash,
    user: &Geohash,
    radius_m: f64,
    reported_accuracy_m: Option<f64>,
    policy: &GeofencePolicy,
) -> Result<GeofenceCheck, GeoError> {
    let distance_m = geohash_distance_m(place, user)?;
    let applied_margin_m = reported_accuracy_m
        .filter(|acc| acc.is_finite() && *acc >= 0.0)
        .map_or(0.0, |acc| acc.min(policy.max_accuracy_m));

    Ok(GeofenceCheck {
        distance_m,
        within_radius: distance_m <= radius_m + applied_margin_m,
        applied_margin_m,
    })
}
