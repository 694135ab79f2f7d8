use crate::error::{Result, VoxError};
use std::collections::VecDeque;

/// Where captured PCM comes from: a microphone, a WAV file or a script.
pub trait AudioSource: Send {
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Read whatever 16-bit PCM samples arrived since the last call.
    ///
    /// An empty vector means "nothing yet" for live sources and "exhausted"
    /// for finite ones.
    fn read_samples(&mut self) -> Result<Vec<i16>>;

    /// Whether the source ends on its own (files, scripted input).
    fn is_finite(&self) -> bool {
        false
    }
}

/// Scripted capture for tests.
///
/// Plays back a script of buffers once and then reports exhaustion. Without
/// a script it returns the configured samples forever.
#[derive(Debug, Clone)]
pub struct MockAudioSource {
    is_started: bool,
    samples: Vec<i16>,
    script: Option<VecDeque<Vec<i16>>>,
    should_fail_start: bool,
    should_fail_read: bool,
    error_message: String,
}

impl MockAudioSource {
    pub fn new() -> Self {
        Self {
            is_started: false,
            samples: vec![0i16; 160],
            script: None,
            should_fail_start: false,
            should_fail_read: false,
            error_message: "mock audio error".to_string(),
        }
    }

    /// Loop `samples` forever, like a live device.
    pub fn with_samples(mut self, samples: Vec<i16>) -> Self {
        self.samples = samples;
        self
    }

    /// Return each buffer once, in order, then report exhaustion
    pub fn with_script(mut self, buffers: Vec<Vec<i16>>) -> Self {
        self.script = Some(buffers.into());
        self
    }

    pub fn with_start_failure(mut self) -> Self {
        self.should_fail_start = true;
        self
    }

    pub fn with_read_failure(mut self) -> Self {
        self.should_fail_read = true;
        self
    }

    pub fn with_error_message(mut self, message: &str) -> Self {
        self.error_message = message.to_string();
        self
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    fn failure(&self) -> VoxError {
        VoxError::Device {
            message: self.error_message.clone(),
        }
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<()> {
        if self.should_fail_start {
            return Err(self.failure());
        }
        self.is_started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.is_started = false;
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        if self.should_fail_read {
            return Err(self.failure());
        }
        match self.script.as_mut() {
            Some(script) => Ok(script.pop_front().unwrap_or_default()),
            None => Ok(self.samples.clone()),
        }
    }

    fn is_finite(&self) -> bool {
        self.script.is_some()
    }
}
