use crate::error::{Result, VoxError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for speech-to-text transcription.
///
/// This trait allows swapping implementations (real model vs mock).
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance of 16-bit mono PCM at the capture rate.
    ///
    /// An empty string means the segment held no words.
    fn transcribe(&self, audio: &[i16]) -> Result<String>;

    /// Get the name of the loaded model
    fn model_name(&self) -> &str;
}

/// Implement Transcriber for Arc<T> to allow sharing across sessions.
impl<T: Transcriber + ?Sized> Transcriber for Arc<T> {
    fn transcribe(&self, audio: &[i16]) -> Result<String> {
        (**self).transcribe(audio)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Mock transcriber for testing
///
/// Answers from a script of responses (then the fallback response) and
/// records the length of every segment it was handed.
#[derive(Debug, Clone)]
pub struct MockTranscriber {
    model_name: String,
    response: String,
    script: Arc<Mutex<VecDeque<Result<String>>>>,
    received: Arc<Mutex<Vec<Vec<i16>>>>,
    delay: Duration,
    should_fail: bool,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
            should_fail: false,
        }
    }

    /// Configure the mock to return a specific response
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Answer the next calls with these results, in order
    pub fn with_script(self, results: Vec<Result<String>>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(results);
        }
        self
    }

    /// Configure the mock to fail on transcribe
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Simulate inference time
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every segment transcribed so far (shared between clones)
    pub fn received(&self) -> Vec<Vec<i16>> {
        match self.received.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, audio: &[i16]) -> Result<String> {
        if let Ok(mut received) = self.received.lock() {
            received.push(audio.to_vec());
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.should_fail {
            return Err(VoxError::backend("transcription", "mock transcription failure"));
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        scripted.unwrap_or_else(|| Ok(self.response.clone()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
