//! # Geographic Utilities
//!
//! Geographic computations used by the motion classifier and the cell store.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS points |
//! | [`derived_speed`] | Speed between two consecutive samples |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//! | [`bounds_around`] | Square bounding box around a point |
//!
//! ## Example
//!
//! ```rust
//! use pulse_grid::{GpsPoint, geo_utils};
//!
//! let anchor = GpsPoint::new(22.3000, 114.1700);
//! let here = GpsPoint::new(22.3005, 114.1700);
//!
//! // ~55m north of the anchor
//! let dist = geo_utils::haversine_distance(&anchor, &here);
//! assert!(dist > 50.0 && dist < 60.0);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! The haversine formula calculates the great-circle distance between two points on a sphere.
//! It's accurate to within 0.3% for most practical applications, far below GPS noise at the
//! 100m stationary radius the classifier works with.
//!
//! Reference: [Haversine formula (Wikipedia)](https://en.wikipedia.org/wiki/Haversine_formula)
//!
//! ### Coordinate System
//!
//! All coordinates are WGS84 degrees. Longitude is x and latitude is y when converting to
//! `geo` and `rstar` types.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsPoint, Sample};

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two GPS points using the Haversine formula.
///
/// Returns the distance in meters along the Earth's surface (assuming a spherical Earth
/// with radius 6,371 km).
///
/// # Example
///
/// ```rust
/// use pulse_grid::{GpsPoint, geo_utils};
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Speed in meters per second between two consecutive samples.
///
/// Uses the sample timestamps, not arrival time. Returns `None` when the samples are
/// not strictly increasing in time, since a zero or negative interval carries no speed.
///
/// # Example
///
/// ```rust
/// use pulse_grid::{Sample, geo_utils};
///
/// let prev = Sample::new(22.3000, 114.1700, 0);
/// let cur = Sample::new(22.3009, 114.1700, 10_000); // ~100m in 10s
///
/// let speed = geo_utils::derived_speed(&prev, &cur).unwrap();
/// assert!((speed - 10.0).abs() < 0.5);
/// ```
pub fn derived_speed(prev: &Sample, cur: &Sample) -> Option<f64> {
    let dt_ms = cur.time - prev.time;
    if dt_ms <= 0 {
        return None;
    }
    let distance = haversine_distance(&prev.point(), &cur.point());
    Some(distance / (dt_ms as f64 / 1000.0))
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale at `latitude`, which is the larger of the two degree
/// spans, so a box built with it always covers the requested distance.
///
/// - At the equator, 1 degree ≈ 111,320 meters
/// - Near the poles the scale is clamped so the result stays finite
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    let meters_per_degree = 111_320.0 * lat_rad.cos().max(0.1);
    meters / meters_per_degree
}

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Square bounding box extending `radius_meters` in every direction from `center`.
///
/// # Example
///
/// ```rust
/// use pulse_grid::{GpsPoint, geo_utils};
///
/// let center = GpsPoint::new(22.30, 114.17);
/// let bounds = geo_utils::bounds_around(&center, 500.0);
/// assert!(bounds.contains(&center));
/// assert!(!bounds.contains(&GpsPoint::new(22.32, 114.17)));
/// ```
pub fn bounds_around(center: &GpsPoint, radius_meters: f64) -> Bounds {
    let delta = meters_to_degrees(radius_meters, center.latitude);
    Bounds {
        min_lat: center.latitude - delta,
        max_lat: center.latitude + delta,
        min_lng: center.longitude - delta,
        max_lng: center.longitude + delta,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
