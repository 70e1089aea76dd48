//! Error types for the pulse engine.
//!
//! None of these are fatal. Each class has a fixed handling policy inside the
//! engine:
//!
//! | Error | Raised by | Policy |
//! |-------|-----------|--------|
//! | [`SensorError`] | the sample stream | logged, sample skipped |
//! | [`ConfigLoadError`] | a [`crate::ConfigSource`] | logged, defaults kept |
//! | [`UploadError`] | a [`crate::BatchSink`] | logged, batch dropped |

use thiserror::Error;

/// Failure reported by the location provider in place of a sample.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("location provider failed: {0}")]
    Provider(String),

    #[error("location provider timed out")]
    Timeout,
}

/// Remote configuration could not be loaded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigLoadError {
    #[error("config endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("config endpoint returned HTTP {0}")]
    Status(u16),

    #[error("malformed config payload: {0}")]
    Malformed(String),
}

/// A batch upload attempt failed. The batch is gone either way.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UploadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("remote store returned HTTP {0}")]
    Status(u16),

    #[error("failed to encode batch: {0}")]
    Encode(String),
}

/// Crate-level error.
#[derive(Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum Error {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    ConfigLoad(#[from] ConfigLoadError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("failed to create HTTP client: {0}")]
    Client(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
