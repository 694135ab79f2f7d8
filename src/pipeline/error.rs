//! Error types and reporting for pipeline stations.

use crate::error::VoxError;
use std::fmt;

/// Errors that can occur during station processing.
#[derive(Debug, Clone)]
pub enum StationError {
    /// One unit of work was lost; the station keeps running.
    Recoverable(String),
    /// The station cannot continue and shuts down.
    Fatal(String),
}

impl fmt::Display for StationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            StationError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for StationError {}

impl From<VoxError> for StationError {
    /// Device failures and closed stages end the station; everything else
    /// costs one unit of work.
    fn from(err: VoxError) -> Self {
        match err {
            VoxError::Device { .. }
            | VoxError::DeviceNotFound { .. }
            | VoxError::PipelineClosed { .. } => StationError::Fatal(err.to_string()),
            other => StationError::Recoverable(other.to_string()),
        }
    }
}

/// Trait for reporting station errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a station.
    fn report(&self, station: &str, error: &StationError);
}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, station: &str, error: &StationError) {
        match error {
            StationError::Recoverable(msg) => tracing::warn!(station, "{}", msg),
            StationError::Fatal(msg) => tracing::error!(station, "{}", msg),
        }
    }
}
