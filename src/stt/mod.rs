//! Speech-to-text seam.

pub mod transcriber;
