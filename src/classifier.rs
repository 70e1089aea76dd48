//! Motion classification.
//!
//! A small state machine around one stationary anchor:
//!
//! 1. A sample at or beyond `stationary_radius_m` from the anchor (or with no
//!    anchor yet) replaces the anchor and classifies as `path`.
//! 2. A sample inside the radius classifies as `resting` once the anchor is
//!    older than `resting_threshold_ms`, unless the holder is moving faster
//!    than `speed_threshold_mps`.
//!
//! The classifier also remembers the last known position, which the heartbeat
//! uses to synthesize resting pulses while the sensor is silent. The heartbeat
//! honours the same speed gate, using the speed of the latest sample.

use log::debug;

use crate::config::EngineConfig;
use crate::geo_utils::{derived_speed, haversine_distance};
use crate::{GpsPoint, Pulse, PulseKind, Sample};

/// Meters per building level
pub const METERS_PER_FLOOR: f64 = 3.0;

/// Reference point and start time used to detect lingering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StationaryAnchor {
    pub latitude: f64,
    pub longitude: f64,
    /// When the holder arrived (engine clock, epoch ms)
    pub since_ms: i64,
}

impl StationaryAnchor {
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    fn held_longer_than(&self, now_ms: i64, threshold_ms: u64) -> bool {
        now_ms.saturating_sub(self.since_ms) > threshold_ms as i64
    }
}

/// Estimate the building level from altitude. Missing or non-finite altitude is level 0.
pub fn estimate_floor(altitude: Option<f64>) -> i32 {
    match altitude {
        Some(alt) if alt.is_finite() => (alt / METERS_PER_FLOOR).trunc() as i32,
        _ => 0,
    }
}

fn moving_fast(speed: Option<f64>, config: &EngineConfig) -> bool {
    speed.map_or(false, |s| s > config.speed_threshold_mps)
}

/// Motion state for one tracking session.
#[derive(Debug, Clone, Default)]
pub struct MotionClassifier {
    anchor: Option<StationaryAnchor>,
    last_position: Option<GpsPoint>,
    last_floor: i32,
    prev_sample: Option<Sample>,
    last_speed: Option<f64>,
}

impl MotionClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one sample at engine time `now_ms`.
    ///
    /// Returns `None` for samples with unusable coordinates; those leave all
    /// state untouched.
    pub fn classify(&mut self, sample: &Sample, now_ms: i64, config: &EngineConfig) -> Option<Pulse> {
        let point = sample.point();
        if !point.is_valid() {
            debug!("[Classifier] dropping sample with invalid coordinates {:?}", point);
            return None;
        }

        let speed = sample
            .speed
            .filter(|s| s.is_finite() && *s >= 0.0)
            .or_else(|| self.prev_sample.as_ref().and_then(|prev| derived_speed(prev, sample)));
        let floor = estimate_floor(sample.altitude);

        self.prev_sample = Some(*sample);
        self.last_position = Some(point);
        self.last_floor = floor;
        self.last_speed = speed;

        let kind = match self.anchor {
            Some(anchor) if haversine_distance(&anchor.point(), &point) < config.stationary_radius_m => {
                if anchor.held_longer_than(now_ms, config.resting_threshold_ms) && !moving_fast(speed, config) {
                    PulseKind::Resting
                } else {
                    PulseKind::Path
                }
            }
            _ => {
                self.anchor = Some(StationaryAnchor {
                    latitude: point.latitude,
                    longitude: point.longitude,
                    since_ms: now_ms,
                });
                PulseKind::Path
            }
        };

        Some(Pulse::new(point, kind, floor))
    }

    /// Synthesize a resting pulse at the last known position if the anchor has
    /// been held past the resting threshold.
    pub fn heartbeat(&self, now_ms: i64, config: &EngineConfig) -> Option<Pulse> {
        let anchor = self.anchor?;
        let position = self.last_position?;
        if !anchor.held_longer_than(now_ms, config.resting_threshold_ms) || moving_fast(self.last_speed, config) {
            return None;
        }
        Some(Pulse::new(position, PulseKind::Resting, self.last_floor))
    }

    /// Forget the anchor and position history (new session).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn anchor(&self) -> Option<StationaryAnchor> {
        self.anchor
    }

    pub fn last_known_position(&self) -> Option<GpsPoint> {
        self.last_position
    }

    /// Reported speed of the last sample, or the speed derived from the last two.
    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }
}
