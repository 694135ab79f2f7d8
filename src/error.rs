//! Error types for duplexvox.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxError {
    // Configuration errors (fatal at startup)
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Backend call failures (one unit of work is dropped)
    #[error("{stage} backend failed: {message}")]
    TransientBackend { stage: String, message: String },

    // Capture or playback device unavailable (fatal for that stage)
    #[error("Audio device failure: {message}")]
    Device { message: String },

    #[error("Audio device not found: {device}")]
    DeviceNotFound { device: String },

    // Internal ordering bug
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    // A stage went away underneath us (session-ending)
    #[error("Pipeline stage '{stage}' closed unexpectedly")]
    PipelineClosed { stage: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxError {
    /// Shorthand for a failed backend call in the named stage.
    pub fn backend(stage: &str, message: impl Into<String>) -> Self {
        VoxError::TransientBackend {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for an invalid configuration value.
    pub fn invalid(key: &str, message: impl Into<String>) -> Self {
        VoxError::ConfigInvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// True for failures that only cost one unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, VoxError::TransientBackend { .. })
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxError>;
