//! Data types passed between pipeline stages.

use std::time::{Duration, Instant};

/// Identifies one chat turn. Increases by one per turn, starting at 1.
pub type TurnId = u64;

/// Per-turn sequence number of a synthesis batch, starting at 1.
pub type SeqNo = u64;

/// A fixed-size block of captured mono PCM.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM samples (16-bit signed integers).
    pub samples: Vec<i16>,
    /// Timestamp when this frame was captured.
    pub timestamp: Instant,
    /// Sequence number for ordering and gap detection.
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, timestamp: Instant, sequence: u64) -> Self {
        Self {
            samples,
            timestamp,
            sequence,
        }
    }
}

/// One closed utterance, ready for transcription.
#[derive(Debug, Clone)]
pub struct UtteranceSegment {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Counts segments emitted by the segmenter.
    pub sequence: u64,
    /// True when the segment was cut at the maximum duration rather than
    /// closed by silence.
    pub split: bool,
}

impl UtteranceSegment {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Non-empty text recognized from one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Sequence number of the source segment.
    pub segment: u64,
    /// Time spent in the transcription backend.
    pub elapsed: Duration,
}

impl Transcript {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            segment: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Orchestrator → batcher traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechRequest {
    /// A sentence to speak as part of `turn`.
    Text { turn: TurnId, text: String },
    /// No more text will follow for `turn`.
    EndTurn { turn: TurnId },
    /// Stop the synthesis stage.
    Shutdown,
}

/// Sentences combined into one synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBatch {
    pub turn: TurnId,
    pub seq: SeqNo,
    pub text: String,
}

/// One synthesized chunk tagged with its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioResult {
    pub turn: TurnId,
    pub seq: SeqNo,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub text: String,
}

/// Dispatcher → reassembler traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Audio(AudioResult),
    /// Batch `seq` will produce no more chunks (finished, failed or cancelled).
    BatchDone { turn: TurnId, seq: SeqNo },
    /// Every batch of `turn` is done; `last_seq` is 0 when there were none.
    TurnSealed { turn: TurnId, last_seq: SeqNo },
}

impl PlaybackEvent {
    pub fn turn(&self) -> TurnId {
        match self {
            PlaybackEvent::Audio(result) => result.turn,
            PlaybackEvent::BatchDone { turn, .. } | PlaybackEvent::TurnSealed { turn, .. } => *turn,
        }
    }
}

/// Reassembler → orchestrator acknowledgements.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackNotice {
    /// This text was played to the end.
    Spoken { turn: TurnId, text: String },
    /// Nothing more of `turn` will be played.
    TurnComplete { turn: TurnId },
}
