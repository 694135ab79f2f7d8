//! Playback device seam.

use crate::error::{Result, VoxError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait for audio output devices.
///
/// `play` blocks until the device has finished the buffer, so two segments
/// can never overlap.
pub trait AudioSink: Send {
    /// Play mono f32 samples at `sample_rate` and return once playback ended.
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;

    fn name(&self) -> &'static str {
        "audio-sink"
    }
}

/// A buffer that went through [`CollectorAudioSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Sink that records everything it is asked to play.
///
/// Clones share the same record, so a test keeps one clone and hands the
/// other to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CollectorAudioSink {
    played: Arc<Mutex<Vec<PlayedBuffer>>>,
    play_delay: Duration,
    fail_after: Option<usize>,
}

impl CollectorAudioSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate device time per buffer.
    pub fn with_play_delay(mut self, delay: Duration) -> Self {
        self.play_delay = delay;
        self
    }

    /// Fail every play call after `count` successful ones.
    pub fn with_failure_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn played(&self) -> Vec<PlayedBuffer> {
        match self.played.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AudioSink for CollectorAudioSink {
    fn play(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        let mut played = self.played.lock().map_err(|e| VoxError::Device {
            message: format!("collector lock poisoned: {}", e),
        })?;
        if self.fail_after.is_some_and(|limit| played.len() >= limit) {
            return Err(VoxError::Device {
                message: "mock speaker unplugged".to_string(),
            });
        }
        played.push(PlayedBuffer {
            samples: samples.to_vec(),
            sample_rate,
        });
        drop(played);

        if !self.play_delay.is_zero() {
            std::thread::sleep(self.play_delay);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "collector"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_records_buffers_across_clones() {
        let sink = CollectorAudioSink::new();
        let mut handle = sink.clone();

        handle.play(&[0.1, 0.2], 24000).unwrap();
        handle.play(&[0.3], 48000).unwrap();

        let played = sink.played();
        assert_eq!(played.len(), 2);
        assert_eq!(played[0].samples, vec![0.1, 0.2]);
        assert_eq!(played[1].sample_rate, 48000);
    }

    #[test]
    fn test_collector_failure_after_limit() {
        let mut sink = CollectorAudioSink::new().with_failure_after(1);
        assert!(sink.play(&[0.0], 24000).is_ok());
        assert!(matches!(
            sink.play(&[0.0], 24000),
            Err(VoxError::Device { .. })
        ));
        assert_eq!(sink.played().len(), 1);
    }
}
