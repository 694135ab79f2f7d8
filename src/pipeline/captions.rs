//! Subtitle output for the sentence being spoken.

use crate::error::{Result, VoxError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Receives the text of each segment right before it plays and an empty
/// string once it has finished.
///
/// Publishing is best-effort: the caller logs failures and carries on.
pub trait CaptionSink: Send {
    fn publish(&mut self, text: &str) -> Result<()>;
}

/// Overwrites a file with the current caption (e.g. for an OBS text source).
#[derive(Debug, Clone)]
pub struct FileCaptionSink {
    path: PathBuf,
}

impl FileCaptionSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CaptionSink for FileCaptionSink {
    fn publish(&mut self, text: &str) -> Result<()> {
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Discards captions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCaptionSink;

impl CaptionSink for NullCaptionSink {
    fn publish(&mut self, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// Keeps every published caption; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryCaptionSink {
    published: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl MemoryCaptionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record nothing and fail every publish.
    pub fn with_failure(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn published(&self) -> Vec<String> {
        match self.published.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CaptionSink for MemoryCaptionSink {
    fn publish(&mut self, text: &str) -> Result<()> {
        if self.fail {
            return Err(VoxError::Other("caption display unavailable".to_string()));
        }
        if let Ok(mut published) = self.published.lock() {
            published.push(text.to_string());
        }
        Ok(())
    }
}
