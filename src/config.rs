use crate::defaults;
use crate::error::{Result, VoxError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub vad: VadConfig,
    pub turn: TurnConfig,
    pub synthesis: SynthesisConfig,
    pub playback: PlaybackConfig,
    pub channels: ChannelConfig,
}

/// Voice activity segmentation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    pub device: Option<String>,
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub frames_per_window: usize,
    pub classifier_window: usize,
    pub vad_threshold: f32,
    pub percent_of_speech: f32,
    pub silence_hysteresis_count: u32,
    pub max_utterance_ms: u64,
}

/// Chat turn behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnConfig {
    pub system_prompt: String,
    pub debounce_per_char_ms: f64,
    pub debounce_cap_ms: u64,
}

/// Batching and synthesis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SynthesisConfig {
    pub parallelism: usize,
    pub sample_rate: u32,
    pub batch_delay_floor_ms: u64,
    pub batch_delay_growth: f32,
    pub batch_delay_ceiling_ms: u64,
    /// Write every synthesized chunk as a WAV file here.
    pub archive_dir: Option<PathBuf>,
}

/// Ordered playback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub device: Option<String>,
    pub lead_in_trim_ms: u64,
    pub trail_out_trim_ms: u64,
    pub playback_rate: f32,
    /// Subtitle file rewritten with the sentence being spoken.
    pub caption_path: Option<PathBuf>,
    /// Panic on sequence protocol violations instead of skipping them.
    /// Unset means "only in debug builds".
    pub strict_protocol: Option<bool>,
}

/// Channel capacities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub capture_buffer: usize,
    pub playback_buffer: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: defaults::SAMPLE_RATE,
            frame_samples: defaults::FRAME_SAMPLES,
            frames_per_window: defaults::FRAMES_PER_WINDOW,
            classifier_window: defaults::CLASSIFIER_WINDOW,
            vad_threshold: defaults::VAD_THRESHOLD,
            percent_of_speech: defaults::PERCENT_OF_SPEECH,
            silence_hysteresis_count: defaults::SILENCE_HYSTERESIS_COUNT,
            max_utterance_ms: defaults::MAX_UTTERANCE_MS,
        }
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            debounce_per_char_ms: defaults::DEBOUNCE_PER_CHAR_MS,
            debounce_cap_ms: defaults::DEBOUNCE_CAP_MS,
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            parallelism: defaults::SYNTHESIS_PARALLELISM,
            sample_rate: defaults::SYNTHESIS_SAMPLE_RATE,
            batch_delay_floor_ms: defaults::BATCH_DELAY_FLOOR_MS,
            batch_delay_growth: defaults::BATCH_DELAY_GROWTH,
            batch_delay_ceiling_ms: defaults::BATCH_DELAY_CEILING_MS,
            archive_dir: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            lead_in_trim_ms: defaults::LEAD_IN_TRIM_MS,
            trail_out_trim_ms: defaults::TRAIL_OUT_TRIM_MS,
            playback_rate: defaults::PLAYBACK_RATE,
            caption_path: None,
            strict_protocol: None,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capture_buffer: defaults::CAPTURE_BUFFER_FRAMES,
            playback_buffer: defaults::PLAYBACK_BUFFER,
        }
    }
}

impl PlaybackConfig {
    /// Resolved strictness: explicit setting, else on in debug builds.
    pub fn strict_protocol(&self) -> bool {
        self.strict_protocol.unwrap_or(cfg!(debug_assertions))
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if it doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DUPLEXVOX_AUDIO_DEVICE → vad.device
    /// - DUPLEXVOX_VAD_THRESHOLD → vad.vad_threshold
    /// - DUPLEXVOX_SYNTHESIS_PARALLELISM → synthesis.parallelism
    /// - DUPLEXVOX_SYSTEM_PROMPT → turn.system_prompt
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(device) = std::env::var("DUPLEXVOX_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.vad.device = Some(device);
        }

        if let Some(threshold) = parse_env::<f32>("DUPLEXVOX_VAD_THRESHOLD") {
            self.vad.vad_threshold = threshold;
        }

        if let Some(parallelism) = parse_env::<usize>("DUPLEXVOX_SYNTHESIS_PARALLELISM") {
            self.synthesis.parallelism = parallelism;
        }

        if let Ok(prompt) = std::env::var("DUPLEXVOX_SYSTEM_PROMPT")
            && !prompt.is_empty()
        {
            self.turn.system_prompt = prompt;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/duplexvox/config.toml on Linux
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("duplexvox").join("config.toml"))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.tunables().validate()?;

        if self.vad.sample_rate == 0 {
            return Err(VoxError::invalid("vad.sample_rate", "must be positive"));
        }
        if self.vad.frame_samples == 0 {
            return Err(VoxError::invalid("vad.frame_samples", "must be positive"));
        }
        if self.vad.frames_per_window == 0 {
            return Err(VoxError::invalid("vad.frames_per_window", "must be positive"));
        }
        if self.vad.classifier_window == 0 {
            return Err(VoxError::invalid("vad.classifier_window", "must be positive"));
        }
        if self.turn.debounce_per_char_ms < 0.0 || !self.turn.debounce_per_char_ms.is_finite() {
            return Err(VoxError::invalid(
                "turn.debounce_per_char_ms",
                "must be a non-negative number",
            ));
        }
        if self.synthesis.parallelism == 0 {
            return Err(VoxError::invalid("synthesis.parallelism", "must be at least 1"));
        }
        if self.synthesis.sample_rate == 0 {
            return Err(VoxError::invalid("synthesis.sample_rate", "must be positive"));
        }
        if self.channels.capture_buffer == 0 {
            return Err(VoxError::invalid("channels.capture_buffer", "must be positive"));
        }
        if self.channels.playback_buffer == 0 {
            return Err(VoxError::invalid("channels.playback_buffer", "must be positive"));
        }
        Ok(())
    }

    /// The runtime-tunable subset of this configuration.
    pub fn tunables(&self) -> Tunables {
        Tunables {
            vad_threshold: self.vad.vad_threshold,
            percent_of_speech: self.vad.percent_of_speech,
            silence_hysteresis_count: self.vad.silence_hysteresis_count,
            max_utterance_duration: Duration::from_millis(self.vad.max_utterance_ms),
            batch_delay_floor: Duration::from_millis(self.synthesis.batch_delay_floor_ms),
            batch_delay_growth: self.synthesis.batch_delay_growth,
            batch_delay_ceiling: Duration::from_millis(self.synthesis.batch_delay_ceiling_ms),
            lead_in_trim: Duration::from_millis(self.playback.lead_in_trim_ms),
            trail_out_trim: Duration::from_millis(self.playback.trail_out_trim_ms),
            playback_rate: self.playback.playback_rate,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok().filter(|v| !v.is_empty())?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Settings that may change while the pipeline is running.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tunables {
    pub vad_threshold: f32,
    pub percent_of_speech: f32,
    pub silence_hysteresis_count: u32,
    pub max_utterance_duration: Duration,
    pub batch_delay_floor: Duration,
    pub batch_delay_growth: f32,
    pub batch_delay_ceiling: Duration,
    pub lead_in_trim: Duration,
    pub trail_out_trim: Duration,
    pub playback_rate: f32,
}

impl Default for Tunables {
    fn default() -> Self {
        Config::default().tunables()
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vad_threshold) {
            return Err(VoxError::invalid("vad_threshold", "must be within 0.0..=1.0"));
        }
        if !(0.0..1.0).contains(&self.percent_of_speech) {
            return Err(VoxError::invalid("percent_of_speech", "must be within 0.0..1.0"));
        }
        if self.silence_hysteresis_count == 0 {
            return Err(VoxError::invalid("silence_hysteresis_count", "must be at least 1"));
        }
        if self.max_utterance_duration.is_zero() {
            return Err(VoxError::invalid("max_utterance_duration", "must be positive"));
        }
        if !(self.batch_delay_growth >= 1.0 && self.batch_delay_growth.is_finite()) {
            return Err(VoxError::invalid("batch_delay_growth", "must be a finite factor >= 1.0"));
        }
        if self.batch_delay_ceiling < self.batch_delay_floor {
            return Err(VoxError::invalid(
                "batch_delay_ceiling",
                "must not be below batch_delay_floor",
            ));
        }
        if !(self.playback_rate > 0.0 && self.playback_rate.is_finite()) {
            return Err(VoxError::invalid("playback_rate", "must be a positive number"));
        }
        Ok(())
    }
}

/// Shared handle to the live [`Tunables`].
///
/// Stations take a snapshot per unit of work, so an update applies from the
/// next window, batch or segment onwards.
#[derive(Debug, Clone, Default)]
pub struct LiveSettings {
    inner: Arc<RwLock<Tunables>>,
}

impl LiveSettings {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
        }
    }

    pub fn snapshot(&self) -> Tunables {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply `change` if the result validates; otherwise keep the old values.
    pub fn update(&self, change: impl FnOnce(&mut Tunables)) -> Result<()> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = *guard;
        change(&mut next);
        next.validate()?;
        tracing::info!(?next, "tunables updated");
        *guard = next;
        Ok(())
    }
}
