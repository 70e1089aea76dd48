//! # Pulse Grid
//!
//! Motion classification and lossy grid-energy aggregation for mobile location streams.
//!
//! This library provides:
//! - A motion classifier that turns raw location samples into `path` / `resting` pulses
//! - A heartbeat that keeps a held position accumulating energy while the sensor is silent
//! - A grid aggregator that quantizes pulses into ~11m cells
//! - A circuit-breaker uploader that ships each batch exactly once and drops it on failure
//!
//! ## Features
//!
//! - **`http`** - Enable the HTTP transport for remote config, uploads and cell queries
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pulse_grid::{CellStore, Engine, EngineConfig, Sample, VirtualClock};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(CellStore::new());
//! let clock = Arc::new(VirtualClock::new(0));
//! let engine = Engine::with_timing(EngineConfig::default(), store.clone(), clock.clone(), clock.clone());
//!
//! engine.start(futures::stream::pending());
//! engine.ingest(Sample::new(22.3000, 114.1700, 0));
//!
//! // Held position: the heartbeat keeps adding resting energy
//! clock.advance(std::time::Duration::from_secs(15));
//!
//! assert_eq!(engine.snapshot().len(), 1);
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{ConfigLoadError, Error, Result, SensorError, UploadError};

pub mod geo_utils;

// Motion state machine (anchor + last known position)
pub mod classifier;
pub use classifier::{MotionClassifier, StationaryAnchor};

// Per-cell energy table
pub mod grid;
pub use grid::{grid_id, GridAggregator, GridCell};

pub mod config;
pub use config::{ConfigChange, ConfigSource, EngineConfig, RemoteConfig, StaticConfig};

pub mod scheduler;
pub use scheduler::{Clock, PeriodicTimer, Scheduler, SystemClock, TickFn, TokioScheduler, VirtualClock};

pub mod upload;
pub use upload::{BatchSink, CredentialStore, PendingBatch, UploadRecord};

pub mod engine;
pub use engine::{Engine, EngineStats};

// Server-side view of uploaded cells
pub mod store;
pub use store::{CellCenter, CellStats, CellStore, CellSummary};

// HTTP transport for the remote store
#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpRemote, HttpRemoteConfig};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("PulseGridRust")
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use pulse_grid::GpsPoint;
/// let point = GpsPoint::new(22.3000, 114.1700);
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Check if a point lies inside the box (edges inclusive).
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

/// A raw sample from the location provider.
///
/// Samples are consumed by the classifier and not retained beyond the
/// previous-sample slot used for speed derivation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Sample {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level, if the provider reports it
    pub altitude: Option<f64>,
    /// Meters per second, if the provider reports it
    pub speed: Option<f64>,
    /// Fix time (Unix epoch milliseconds)
    pub time: i64,
}

impl Sample {
    /// Create a sample with no altitude or speed.
    pub fn new(latitude: f64, longitude: f64, time: i64) -> Self {
        Self { latitude, longitude, altitude: None, speed: None, time }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Motion classification of a pulse.
///
/// Ordered so that `Resting > Path`; merging takes the maximum, which makes
/// the upgrade to `Resting` one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
#[serde(rename_all = "lowercase")]
pub enum PulseKind {
    /// Transiting through
    Path,
    /// Lingering near one point
    Resting,
}

impl PulseKind {
    /// Energy contributed by one pulse of this kind.
    pub fn intensity(self) -> u32 {
        match self {
            PulseKind::Path => 1,
            PulseKind::Resting => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PulseKind::Path => "path",
            PulseKind::Resting => "resting",
        }
    }
}

impl std::fmt::Display for PulseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified motion observation, about to be merged into a grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub latitude: f64,
    pub longitude: f64,
    pub kind: PulseKind,
    /// Always >= 1
    pub intensity: u32,
    /// Estimated building level (altitude / 3m)
    pub floor: i32,
}

impl Pulse {
    /// Create a pulse carrying the standard intensity for `kind`.
    pub fn new(point: GpsPoint, kind: PulseKind, floor: i32) -> Self {
        Self {
            latitude: point.latitude,
            longitude: point.longitude,
            kind,
            intensity: kind.intensity(),
            floor,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
mod ffi {
    use super::*;
    use futures::channel::mpsc;
    use log::{info, warn};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::runtime::{Builder, Runtime};

    type SampleFeed = mpsc::UnboundedSender<std::result::Result<Sample, SensorError>>;

    /// Engine handle for mobile hosts.
    ///
    /// Owns a small tokio runtime so the host can drive it from plain platform
    /// callbacks (location updates, app lifecycle, login state).
    #[derive(uniffi::Object)]
    pub struct MobileEngine {
        runtime: Runtime,
        engine: Engine,
        feed: Mutex<Option<SampleFeed>>,
    }

    #[uniffi::export]
    impl MobileEngine {
        /// Create the engine and start its flush timer. Remote config is fetched
        /// in the background; `config` (or the defaults) applies until it arrives.
        #[uniffi::constructor]
        pub fn new(base_url: String, config: Option<EngineConfig>) -> std::result::Result<Arc<Self>, Error> {
            init_logging();
            info!("[PulseGridRust] MobileEngine::new base_url={}", base_url);

            let runtime = Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .map_err(|e| Error::Client(format!("failed to create tokio runtime: {}", e)))?;

            let remote = Arc::new(HttpRemote::new(HttpRemoteConfig::new(base_url))?);
            let engine = Engine::new(config.unwrap_or_default(), remote.clone());

            {
                let _guard = runtime.enter();
                engine.start_flushing();
                let init_engine = engine.clone();
                runtime.spawn(async move {
                    init_engine.load_remote_config(remote.as_ref()).await;
                });
            }

            Ok(Arc::new(Self {
                runtime,
                engine,
                feed: Mutex::new(None),
            }))
        }

        /// Begin a tracking session. Samples are then delivered with `push_sample`.
        pub fn start_tracking(&self) {
            let (tx, rx) = mpsc::unbounded();
            let _guard = self.runtime.enter();
            self.engine.start(rx);
            *self.feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        }

        pub fn push_sample(&self, sample: Sample) {
            self.send(Ok(sample));
        }

        pub fn report_sensor_error(&self, message: String) {
            self.send(Err(SensorError::Provider(message)));
        }

        pub fn stop_tracking(&self) {
            self.feed.lock().unwrap_or_else(PoisonError::into_inner).take();
            self.engine.stop();
        }

        pub fn is_tracking(&self) -> bool {
            self.engine.is_tracking()
        }

        /// Set or clear the auth token used for uploads.
        pub fn set_credential(&self, token: Option<String>) {
            self.engine.set_credential(token);
        }

        pub fn flush_now(&self) {
            let _guard = self.runtime.enter();
            // Fire-and-forget, same as the timer path
            let _ = self.engine.flush_now();
        }

        pub fn stats(&self) -> EngineStats {
            self.engine.stats()
        }
    }

    impl MobileEngine {
        fn send(&self, item: std::result::Result<Sample, SensorError>) {
            let feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner);
            match feed.as_ref() {
                Some(tx) => {
                    if tx.unbounded_send(item).is_err() {
                        warn!("[PulseGridRust] sample feed closed, dropping sample");
                    }
                }
                None => warn!("[PulseGridRust] not tracking, dropping sample"),
            }
        }
    }

    impl Drop for MobileEngine {
        fn drop(&mut self) {
            let _guard = self.runtime.enter();
            self.engine.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(22.3, 114.17).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 114.17).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 180.5).is_valid());
    }

    #[test]
    fn test_pulse_kind_ordering_and_intensity() {
        assert!(PulseKind::Resting > PulseKind::Path);
        assert_eq!(PulseKind::Path.intensity(), 1);
        assert_eq!(PulseKind::Resting.intensity(), 5);
    }

    #[test]
    fn test_pulse_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PulseKind::Resting).unwrap(), "\"resting\"");
        let kind: PulseKind = serde_json::from_str("\"path\"").unwrap();
        assert_eq!(kind, PulseKind::Path);
    }

    #[test]
    fn test_sample_builders() {
        let s = Sample::new(22.3, 114.17, 42).with_altitude(9.5).with_speed(1.2);
        assert_eq!(s.altitude, Some(9.5));
        assert_eq!(s.speed, Some(1.2));
        assert_eq!(s.point(), GpsPoint::new(22.3, 114.17));
    }
}
