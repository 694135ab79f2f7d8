//! duplexvox - full-duplex voice conversation pipeline
//!
//! Listens continuously, segments speech, transcribes it, streams a model
//! answer sentence by sentence into speech synthesis and plays the audio back
//! in order, while the user can barge in at any point.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod config;
pub mod conversation;
pub mod defaults;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod session;
pub mod stt;
pub mod tts;

// Backend seams
pub use audio::player::AudioSink;
pub use audio::recorder::AudioSource;
pub use audio::vad::SpeechClassifier;
pub use conversation::{Conversation, History, Message, Role};
pub use llm::model::LanguageModel;
pub use stt::transcriber::Transcriber;
pub use tts::synthesizer::Synthesizer;

// Pipeline
pub use pipeline::orchestrator::{Backends, Pipeline, PipelineHandle};
pub use pipeline::turn::{Turn, TurnOrchestrator};
pub use session::SessionContext;

// Error handling
pub use error::{Result, VoxError};

// Config
pub use config::{Config, LiveSettings, Tunables};

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Crate version with the build's git hash appended when one was recorded.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
