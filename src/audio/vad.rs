//! Speech classification for voice activity detection.
//!
//! A [`SpeechClassifier`] scores one fixed-size sub-window; [`speech_fraction`]
//! applies it across a whole VAD window.

use crate::error::Result;

/// Scores a chunk of normalized mono samples with a speech probability.
///
/// Implementations receive exactly `window` samples (short input is padded
/// with zeros by the caller).
pub trait SpeechClassifier: Send {
    /// Probability in `0.0..=1.0` that the chunk contains speech.
    fn speech_probability(&mut self, chunk: &[f32]) -> Result<f32>;

    fn name(&self) -> &'static str {
        "classifier"
    }
}

/// Level-based classifier used when no model is plugged in.
///
/// Maps the RMS level linearly onto `0.0..=1.0`, saturating at `full_scale`.
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    full_scale: f32,
}

impl EnergyClassifier {
    pub fn new(full_scale: f32) -> Self {
        Self {
            full_scale: full_scale.max(f32::EPSILON),
        }
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        // Normal speech at a desk microphone sits around 0.05..0.2 RMS
        Self::new(0.1)
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn speech_probability(&mut self, chunk: &[f32]) -> Result<f32> {
        Ok((calculate_rms(chunk) / self.full_scale).clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// Fraction of `sub_window`-sized pieces of `window` scoring above `threshold`.
///
/// The last piece is zero-padded when short. A classifier failure counts as
/// non-speech for that piece and is logged; capture never stops for it.
pub fn speech_fraction(
    classifier: &mut dyn SpeechClassifier,
    window: &[f32],
    sub_window: usize,
    threshold: f32,
) -> f32 {
    if window.is_empty() || sub_window == 0 {
        return 0.0;
    }

    let mut padded = vec![0.0f32; sub_window];
    let mut total = 0usize;
    let mut speech = 0usize;

    for piece in window.chunks(sub_window) {
        total += 1;
        let chunk: &[f32] = if piece.len() == sub_window {
            piece
        } else {
            padded.fill(0.0);
            padded[..piece.len()].copy_from_slice(piece);
            &padded
        };

        match classifier.speech_probability(chunk) {
            Ok(p) if p > threshold => speech += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(classifier = classifier.name(), error = %e, "classifier failed, treating as silence");
            }
        }
    }

    speech as f32 / total as f32
}

/// Convert 16-bit PCM to f32 in `-1.0..=1.0`.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| s as f32 / i16::MAX as f32)
        .collect()
}

/// Calculates the Root Mean Square (RMS) of normalized audio samples.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let s = sample as f64;
            s * s
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
