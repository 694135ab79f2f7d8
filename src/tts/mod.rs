//! Text-to-speech seam.

pub mod synthesizer;
