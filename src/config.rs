//! Engine tuning: hardcoded defaults plus remote overrides.
//!
//! The remote payload is partial. Any field it omits, or sends as a
//! non-positive or non-finite number, keeps its current value.

use futures::future::BoxFuture;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::ConfigLoadError;

/// Configuration for the pulse engine.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct EngineConfig {
    /// Time the holder must stay inside the stationary radius before pulses
    /// classify as resting.
    /// Default: 10,000 ms
    pub resting_threshold_ms: u64,

    /// Distance from the anchor beyond which a sample starts a new anchor.
    /// Default: 100.0 meters
    pub stationary_radius_m: f64,

    /// Speed above which a sample never classifies as resting, even inside
    /// the stationary radius.
    /// Default: 2.5 m/s (faster than a brisk walk)
    pub speed_threshold_mps: f64,

    /// Period of the upload timer.
    /// Default: 60,000 ms
    pub flush_interval_ms: u64,

    /// Period of the synthetic resting pulse.
    /// Default: 1,000 ms
    pub heartbeat_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resting_threshold_ms: 10_000,
            stationary_radius_m: 100.0,
            speed_threshold_mps: 2.5,
            flush_interval_ms: 60_000,
            heartbeat_interval_ms: 1_000,
        }
    }
}

/// Outcome of applying a [`RemoteConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChange {
    pub fields_applied: u32,
    pub fields_rejected: u32,
    /// The flush timer must be restarted with the new period
    pub flush_interval_changed: bool,
}

impl EngineConfig {
    /// Overlay the fields present in `remote`.
    pub fn apply(&mut self, remote: &RemoteConfig) -> ConfigChange {
        let mut change = ConfigChange::default();

        if let Some(ms) = accept_ms("restingThresholdMs", remote.resting_threshold_ms, &mut change) {
            self.resting_threshold_ms = ms;
        }
        if let Some(m) = accept("stationaryRadius", remote.stationary_radius, &mut change) {
            self.stationary_radius_m = m;
        }
        if let Some(mps) = accept("speedThreshold", remote.speed_threshold, &mut change) {
            self.speed_threshold_mps = mps;
        }
        if let Some(ms) = accept_ms("flushInterval", remote.flush_interval, &mut change) {
            change.flush_interval_changed = ms != self.flush_interval_ms;
            self.flush_interval_ms = ms;
        }

        info!(
            "[Config] applied {} remote fields ({} rejected), flush interval {}ms",
            change.fields_applied, change.fields_rejected, self.flush_interval_ms
        );
        change
    }
}

fn accept(name: &str, value: Option<f64>, change: &mut ConfigChange) -> Option<f64> {
    let value = value?;
    if value.is_finite() && value > 0.0 {
        change.fields_applied += 1;
        Some(value)
    } else {
        reject(name, value, change)
    }
}

/// Millisecond fields must still be at least 1ms after rounding.
fn accept_ms(name: &str, value: Option<f64>, change: &mut ConfigChange) -> Option<u64> {
    let value = value?;
    if value.is_finite() && value.round() >= 1.0 {
        change.fields_applied += 1;
        Some(value.round() as u64)
    } else {
        reject(name, value, change)
    }
}

fn reject<T>(name: &str, value: f64, change: &mut ConfigChange) -> Option<T> {
    warn!("[Config] ignoring invalid {}={}", name, value);
    change.fields_rejected += 1;
    None
}

/// Partial configuration as served by the remote config endpoint.
///
/// ```json
/// {"restingThresholdMs": 15000, "stationaryRadius": 80, "flushInterval": 30000}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resting_threshold_ms: Option<f64>,
    /// Meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stationary_radius: Option<f64>,
    /// Meters per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_threshold: Option<f64>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flush_interval: Option<f64>,
}

impl RemoteConfig {
    pub fn from_json(payload: &str) -> Result<Self, ConfigLoadError> {
        serde_json::from_str(payload).map_err(|e| ConfigLoadError::Malformed(e.to_string()))
    }
}

/// Anything that can supply a [`RemoteConfig`] at engine init.
pub trait ConfigSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<RemoteConfig, ConfigLoadError>>;
}

/// A fixed config, for offline use and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub RemoteConfig);

impl ConfigSource for StaticConfig {
    fn fetch(&self) -> BoxFuture<'_, Result<RemoteConfig, ConfigLoadError>> {
        let config = self.0.clone();
        Box::pin(async move { Ok(config) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.resting_threshold_ms, 10_000);
        assert_eq!(config.stationary_radius_m, 100.0);
        assert_eq!(config.flush_interval_ms, 60_000);
        assert_eq!(config.heartbeat_interval_ms, 1_000);
    }

    #[test]
    fn test_partial_payload_keeps_defaults() {
        let remote = RemoteConfig::from_json(r#"{"stationaryRadius": 80}"#).unwrap();
        let mut config = EngineConfig::default();
        let change = config.apply(&remote);

        assert_eq!(config.stationary_radius_m, 80.0);
        assert_eq!(config.resting_threshold_ms, 10_000);
        assert_eq!(change.fields_applied, 1);
        assert!(!change.flush_interval_changed);
    }

    #[test]
    fn test_flush_interval_change_detected() {
        let mut config = EngineConfig::default();

        let same = RemoteConfig { flush_interval: Some(60_000.0), ..Default::default() };
        assert!(!config.apply(&same).flush_interval_changed);

        let faster = RemoteConfig { flush_interval: Some(30_000.0), ..Default::default() };
        assert!(config.apply(&faster).flush_interval_changed);
        assert_eq!(config.flush_interval_ms, 30_000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let remote = RemoteConfig {
            resting_threshold_ms: Some(-5.0),
            stationary_radius: Some(0.0),
            speed_threshold: Some(f64::NAN),
            flush_interval: None,
        };
        let mut config = EngineConfig::default();
        let change = config.apply(&remote);

        assert_eq!(config, EngineConfig::default());
        assert_eq!(change.fields_rejected, 3);
        assert_eq!(change.fields_applied, 0);
    }

    #[test]
    fn test_sub_millisecond_intervals_rejected() {
        let remote = RemoteConfig {
            resting_threshold_ms: Some(0.4),
            flush_interval: Some(0.4),
            ..Default::default()
        };
        let mut config = EngineConfig::default();
        let change = config.apply(&remote);

        assert_eq!(config.flush_interval_ms, 60_000);
        assert_eq!(config.resting_threshold_ms, 10_000);
        assert_eq!(change.fields_rejected, 2);
        assert!(!change.flush_interval_changed);

        // Rounds up to a valid period
        let change = config.apply(&RemoteConfig { flush_interval: Some(0.6), ..Default::default() });
        assert_eq!(change.fields_applied, 1);
        assert_eq!(config.flush_interval_ms, 1);
    }

    #[test]
    fn test_malformed_payload() {
        let err = RemoteConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigLoadError::Malformed(_)));

        let err = RemoteConfig::from_json(r#"{"flushInterval": "soon"}"#).unwrap_err();
        assert!(matches!(err, ConfigLoadError::Malformed(_)));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let remote = RemoteConfig::from_json(r#"{"theme": "dark", "speedThreshold": 4.0}"#).unwrap();
        assert_eq!(remote.speed_threshold, Some(4.0));
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticConfig(RemoteConfig { flush_interval: Some(5_000.0), ..Default::default() });
        let fetched = source.fetch().await.unwrap();
        assert_eq!(fetched.flush_interval, Some(5_000.0));
    }
}
