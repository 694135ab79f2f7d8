use crate::error::{Result, VoxError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One piece of synthesized speech and the text it voices.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechChunk {
    /// Mono samples in `-1.0..=1.0` at [`Synthesizer::sample_rate`].
    pub samples: Vec<f32>,
    pub text: String,
}

impl SpeechChunk {
    pub fn new(samples: Vec<f32>, text: impl Into<String>) -> Self {
        Self {
            samples,
            text: text.into(),
        }
    }
}

/// Lazy, finite sequence of chunks for one synthesis call.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<SpeechChunk>> + Send + 'a>;

/// Trait for text-to-speech backends.
///
/// `synthesize` may be called from several dispatcher workers at once only
/// when `is_reentrant` returns true.
pub trait Synthesizer: Send + Sync {
    /// Start synthesizing `text`. Chunks are produced as the iterator is
    /// driven; dropping it abandons the rest.
    fn synthesize(&self, text: &str) -> Result<ChunkStream<'_>>;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Whether concurrent `synthesize` calls are safe.
    fn is_reentrant(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

impl<T: Synthesizer + ?Sized> Synthesizer for Arc<T> {
    fn synthesize(&self, text: &str) -> Result<ChunkStream<'_>> {
        (**self).synthesize(text)
    }

    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }

    fn is_reentrant(&self) -> bool {
        (**self).is_reentrant()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Mock synthesizer for testing
///
/// Produces a constant tone per chunk. Delays and failures can be keyed on a
/// substring of the requested text, which is how tests force out-of-order
/// completion.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    sample_rate: u32,
    samples_per_chunk: usize,
    chunk_per_word: bool,
    chunk_delay: Duration,
    delays: Vec<(String, Duration)>,
    failures: Vec<String>,
    reentrant: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            sample_rate: crate::defaults::SYNTHESIS_SAMPLE_RATE,
            samples_per_chunk: 2400,
            chunk_per_word: false,
            chunk_delay: Duration::ZERO,
            delays: Vec::new(),
            failures: Vec::new(),
            reentrant: true,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_samples_per_chunk(mut self, samples: usize) -> Self {
        self.samples_per_chunk = samples;
        self
    }

    /// Emit one chunk per whitespace-separated word instead of one per call.
    pub fn with_chunk_per_word(mut self) -> Self {
        self.chunk_per_word = true;
        self
    }

    /// Sleep before producing every chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Sleep before the first chunk when the text contains `needle`.
    pub fn with_delay_for(mut self, needle: &str, delay: Duration) -> Self {
        self.delays.push((needle.to_string(), delay));
        self
    }

    /// Fail the call when the text contains `needle`.
    pub fn with_failure_for(mut self, needle: &str) -> Self {
        self.failures.push(needle.to_string());
        self
    }

    pub fn with_reentrant(mut self, reentrant: bool) -> Self {
        self.reentrant = reentrant;
        self
    }

    /// Texts requested so far, in call order (shared between clones).
    pub fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synthesizer for MockSynthesizer {
    fn synthesize(&self, text: &str) -> Result<ChunkStream<'_>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(text.to_string());
        }
        if self.failures.iter().any(|f| text.contains(f.as_str())) {
            return Err(VoxError::backend("synthesis", format!("mock failure for {:?}", text)));
        }

        let mut initial_delay = self
            .delays
            .iter()
            .filter(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, delay)| *delay)
            .max()
            .unwrap_or(Duration::ZERO);

        let pieces: Vec<String> = if self.chunk_per_word {
            text.split_whitespace().map(str::to_string).collect()
        } else {
            vec![text.to_string()]
        };
        let samples_per_chunk = self.samples_per_chunk;
        let chunk_delay = self.chunk_delay;

        let mut pieces = pieces.into_iter();
        Ok(Box::new(std::iter::from_fn(move || {
            let piece = pieces.next()?;
            let pause = std::mem::take(&mut initial_delay) + chunk_delay;
            if !pause.is_zero() {
                std::thread::sleep(pause);
            }
            Some(Ok(SpeechChunk::new(vec![0.1; samples_per_chunk], piece)))
        })))
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    fn name(&self) -> &str {
        "mock"
    }
}
