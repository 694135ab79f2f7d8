//! Transcription worker: utterance segments in, transcripts out.

use crate::defaults;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{Transcript, UtteranceSegment};
use crate::stt::transcriber::Transcriber;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Remove bracketed non-speech markers such as `[BLANK_AUDIO]` or `(music)`
/// and collapse whitespace. Unclosed brackets are kept.
fn strip_annotations(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find(['[', '(']) {
        let close_char = if rest[open..].starts_with('[') { ']' } else { ')' };
        kept.push_str(&rest[..open]);
        match rest[open + 1..].find(close_char) {
            Some(len) => rest = &rest[open + 1 + len + 1..],
            None => {
                kept.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    kept.push_str(rest);

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rolling average of the last few transcription latencies.
#[derive(Debug, Clone)]
pub struct TranscriptionTiming {
    samples: VecDeque<Duration>,
    capacity: usize,
}

impl TranscriptionTiming {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
    }
}

impl Default for TranscriptionTiming {
    fn default() -> Self {
        Self::new(defaults::TIMING_WINDOW)
    }
}

/// Runs each segment through the transcriber exactly once.
///
/// Backend failures drop the segment; it is never retried, since the user
/// has already moved on by the time a retry would finish.
pub struct TranscriberStation {
    transcriber: Arc<dyn Transcriber>,
    timing: TranscriptionTiming,
    warned_backpressure: bool,
}

impl TranscriberStation {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self {
            transcriber,
            timing: TranscriptionTiming::default(),
            warned_backpressure: false,
        }
    }

    pub fn timing(&self) -> &TranscriptionTiming {
        &self.timing
    }
}

impl Station for TranscriberStation {
    type Input = UtteranceSegment;
    type Output = Transcript;

    fn name(&self) -> &'static str {
        "transcriber"
    }

    fn process(&mut self, segment: UtteranceSegment) -> Result<Option<Transcript>, StationError> {
        let start = Instant::now();
        let text = self
            .transcriber
            .transcribe(&segment.samples)
            .map_err(|e| StationError::Recoverable(format!("Transcription failed: {}", e)))?;
        let elapsed = start.elapsed();
        self.timing.record(elapsed);

        if !self.warned_backpressure && elapsed > segment.duration() {
            self.warned_backpressure = true;
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                audio_ms = segment.duration().as_millis() as u64,
                model = self.transcriber.model_name(),
                "transcription slower than real-time"
            );
        }

        let text = strip_annotations(&text);
        if text.is_empty() {
            tracing::debug!(segment = segment.sequence, "empty transcript dropped");
            return Ok(None);
        }

        tracing::info!(
            segment = segment.sequence,
            elapsed_ms = elapsed.as_millis() as u64,
            avg_ms = self.timing.average().map(|d| d.as_millis() as u64),
            "transcribed: {}",
            text
        );

        Ok(Some(Transcript {
            text,
            segment: segment.sequence,
            elapsed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoxError;
    use crate::stt::transcriber::MockTranscriber;

    fn segment(sequence: u64) -> UtteranceSegment {
        UtteranceSegment {
            samples: vec![100; 16000],
            sample_rate: 16000,
            sequence,
            split: false,
        }
    }

    #[test]
    fn test_strip_annotations() {
        assert_eq!(strip_annotations("[BLANK_AUDIO]"), "");
        assert_eq!(strip_annotations("  hello   (coughs) world "), "hello world");
        assert_eq!(strip_annotations("open [bracket"), "open [bracket");
        assert_eq!(strip_annotations("plain"), "plain");
    }

    #[test]
    fn test_transcript_forwarded() {
        let transcriber = Arc::new(MockTranscriber::new("m").with_response("  Hello there "));
        let mut station = TranscriberStation::new(transcriber);

        let transcript = station.process(segment(3)).unwrap().unwrap();
        assert_eq!(transcript.text, "Hello there");
        assert_eq!(transcript.segment, 3);
    }

    #[test]
    fn test_empty_transcript_dropped() {
        let transcriber = Arc::new(MockTranscriber::new("m").with_response("   "));
        let mut station = TranscriberStation::new(transcriber);
        assert!(station.process(segment(0)).unwrap().is_none());
    }

    #[test]
    fn test_failure_is_recoverable_and_not_retried() {
        let mock = MockTranscriber::new("m").with_script(vec![
            Err(VoxError::backend("transcription", "cuda oom")),
            Ok("next one".to_string()),
        ]);
        let mut station = TranscriberStation::new(Arc::new(mock.clone()));

        let err = station.process(segment(0)).unwrap_err();
        assert!(matches!(err, StationError::Recoverable(msg) if msg.contains("cuda oom")));

        let transcript = station.process(segment(1)).unwrap().unwrap();
        assert_eq!(transcript.text, "next one");
        assert_eq!(mock.received().len(), 2);
    }

    #[test]
    fn test_timing_keeps_last_window() {
        let mut timing = TranscriptionTiming::new(2);
        assert!(timing.average().is_none());
        timing.record(Duration::from_millis(100));
        timing.record(Duration::from_millis(200));
        timing.record(Duration::from_millis(400));
        assert_eq!(timing.average(), Some(Duration::from_millis(300)));
    }
}
