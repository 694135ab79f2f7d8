//! Duplex voice pipeline.
//!
//! Capture and VAD, transcription, batching, synthesis and playback each run
//! on their own thread and talk over crossbeam channels. The turn
//! orchestrator is async and sits between transcription and batching.

pub mod batcher;
pub mod captions;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod sentence;
pub mod station;
pub mod transcriber_station;
pub mod turn;
pub mod types;
pub mod vad_station;

pub use batcher::{BatchEvent, TextBatcher};
pub use captions::{CaptionSink, FileCaptionSink, MemoryCaptionSink, NullCaptionSink};
pub use dispatcher::{SynthesisDispatcher, run_synthesis};
pub use error::{ErrorReporter, LogReporter, StationError};
pub use orchestrator::{Backends, Pipeline, PipelineHandle};
pub use playback::Reassembler;
pub use sentence::SentenceSplitter;
pub use station::{Station, StationRunner};
pub use transcriber_station::{TranscriberStation, TranscriptionTiming};
pub use turn::{Sentence, Turn, TurnChannels, TurnOrchestrator, TurnOutcome};
pub use types::{
    AudioFrame, AudioResult, PlaybackEvent, PlaybackNotice, SeqNo, SpeechRequest, TextBatch,
    Transcript, TurnId, UtteranceSegment,
};
pub use vad_station::{VadState, VadStation, WindowShape};
