//! Audio devices, classification and file I/O.

#[cfg(feature = "cpal-audio")]
pub mod capture;
pub mod player;
pub mod recorder;
pub mod vad;
pub mod wav;
