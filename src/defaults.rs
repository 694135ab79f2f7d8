//! Default configuration constants for duplexvox.
//!
//! Shared between the TOML configuration, the live tunables and the stations
//! so that every layer agrees on the same starting point.

/// Capture sample rate in Hz.
///
/// 16kHz is what speech recognisers and the VAD classifier expect.
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per captured audio frame.
pub const FRAME_SAMPLES: usize = 1024;

/// Frames combined into one VAD window (2 × 1024 = 128ms at 16kHz).
pub const FRAMES_PER_WINDOW: usize = 2;

/// Sub-window size handed to the speech classifier.
pub const CLASSIFIER_WINDOW: usize = 512;

/// Speech probability above which a sub-window counts as speech.
pub const VAD_THRESHOLD: f32 = 0.5;

/// Fraction of speech sub-windows a window must exceed to count as speech.
///
/// 0.0 means a single speech sub-window is enough.
pub const PERCENT_OF_SPEECH: f32 = 0.0;

/// Consecutive non-speech windows needed to close an utterance.
pub const SILENCE_HYSTERESIS_COUNT: u32 = 3;

/// Hard cut for a single utterance, in milliseconds.
pub const MAX_UTTERANCE_MS: u64 = 20_000;

/// Capacity of the capture → VAD channel, in frames (~2.5s at 16kHz).
pub const CAPTURE_BUFFER_FRAMES: usize = 80;

/// Debounce applied per transcript character before a turn starts.
pub const DEBOUNCE_PER_CHAR_MS: f64 = 2.0;

/// Upper bound on the pre-turn debounce.
pub const DEBOUNCE_CAP_MS: u64 = 2_500;

/// Batch window when the agent is not speaking.
pub const BATCH_DELAY_FLOOR_MS: u64 = 100;

/// Multiplier applied to the batch window after each batch in a turn.
pub const BATCH_DELAY_GROWTH: f32 = 3.0;

/// Upper bound for the batch window.
pub const BATCH_DELAY_CEILING_MS: u64 = 900;

/// Concurrent synthesis jobs. Backends are assumed non-reentrant.
pub const SYNTHESIS_PARALLELISM: usize = 1;

/// Sample rate of synthesized speech.
pub const SYNTHESIS_SAMPLE_RATE: u32 = 24000;

/// Audio trimmed from the start of each synthesized chunk.
pub const LEAD_IN_TRIM_MS: u64 = 240;

/// Audio trimmed from the end of each synthesized chunk.
pub const TRAIL_OUT_TRIM_MS: u64 = 140;

/// Playback speed multiplier.
pub const PLAYBACK_RATE: f32 = 1.0;

/// Capacity of the synthesis → playback channel.
pub const PLAYBACK_BUFFER: usize = 32;

/// Poll interval for the orchestrator's channel checks.
pub const POLL_INTERVAL_MS: u64 = 15;

/// Rolling window for transcription latency averages.
pub const TIMING_WINDOW: usize = 10;
