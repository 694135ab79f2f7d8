//! VAD segmenter: turns captured frames into utterance segments.

use crate::audio::vad::{SpeechClassifier, i16_to_f32, speech_fraction};
use crate::config::LiveSettings;
use crate::pipeline::error::StationError;
use crate::pipeline::station::Station;
use crate::pipeline::types::{AudioFrame, UtteranceSegment};
use crate::session::SessionContext;

/// Segmenter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    Silent,
    Speaking,
}

/// Window geometry for the segmenter.
#[derive(Debug, Clone, Copy)]
pub struct WindowShape {
    pub sample_rate: u32,
    pub frames_per_window: usize,
    pub classifier_window: usize,
}

/// Speech/silence state machine with hysteresis.
///
/// Frames are grouped into windows of `frames_per_window`; each window is
/// classified as a whole. Speech windows are appended to the open segment,
/// non-speech windows only count towards closing it.
pub struct VadStation {
    classifier: Box<dyn SpeechClassifier>,
    session: SessionContext,
    settings: LiveSettings,
    shape: WindowShape,
    state: VadState,
    window: Vec<i16>,
    frames_in_window: usize,
    segment: Vec<i16>,
    silence_counter: u32,
    segments_emitted: u64,
}

impl VadStation {
    pub fn new(
        classifier: Box<dyn SpeechClassifier>,
        session: SessionContext,
        settings: LiveSettings,
        shape: WindowShape,
    ) -> Self {
        Self {
            classifier,
            session,
            settings,
            shape,
            state: VadState::Silent,
            window: Vec::new(),
            frames_in_window: 0,
            segment: Vec::new(),
            silence_counter: 0,
            segments_emitted: 0,
        }
    }

    pub fn state(&self) -> VadState {
        self.state
    }

    fn take_segment(&mut self, split: bool) -> Option<UtteranceSegment> {
        if self.segment.is_empty() {
            return None;
        }
        let segment = UtteranceSegment {
            samples: std::mem::take(&mut self.segment),
            sample_rate: self.shape.sample_rate,
            sequence: self.segments_emitted,
            split,
        };
        self.segments_emitted += 1;
        tracing::debug!(
            sequence = segment.sequence,
            samples = segment.samples.len(),
            split,
            "utterance segment"
        );
        Some(segment)
    }

    /// Run one complete window through the state machine.
    pub fn process_window(&mut self, window: &[i16]) -> Option<UtteranceSegment> {
        let tunables = self.settings.snapshot();
        let normalized = i16_to_f32(window);
        let fraction = speech_fraction(
            self.classifier.as_mut(),
            &normalized,
            self.shape.classifier_window,
            tunables.vad_threshold,
        );
        let is_speech = fraction > tunables.percent_of_speech;

        match (self.state, is_speech) {
            (VadState::Silent, false) => None,
            (VadState::Silent, true) => {
                tracing::debug!(fraction, "speech started");
                self.state = VadState::Speaking;
                self.silence_counter = 0;
                self.session.signal_interrupt();
                self.segment.extend_from_slice(window);
                None
            }
            (VadState::Speaking, true) => {
                self.silence_counter = 0;
                self.session.signal_interrupt();
                self.segment.extend_from_slice(window);

                let max_samples = (tunables.max_utterance_duration.as_secs_f64()
                    * self.shape.sample_rate as f64) as usize;
                if self.segment.len() >= max_samples.max(1) {
                    self.take_segment(true)
                } else {
                    None
                }
            }
            (VadState::Speaking, false) => {
                self.silence_counter += 1;
                if self.silence_counter < tunables.silence_hysteresis_count {
                    return None;
                }
                tracing::debug!(windows = self.silence_counter, "speech ended");
                self.state = VadState::Silent;
                self.silence_counter = 0;
                self.session.clear_interrupt();
                self.take_segment(false)
            }
        }
    }
}

impl Station for VadStation {
    type Input = AudioFrame;
    type Output = UtteranceSegment;

    fn name(&self) -> &'static str {
        "vad"
    }

    fn process(&mut self, frame: AudioFrame) -> Result<Option<UtteranceSegment>, StationError> {
        if frame.samples.is_empty() {
            return Ok(None);
        }

        self.window.extend_from_slice(&frame.samples);
        self.frames_in_window += 1;
        if self.frames_in_window < self.shape.frames_per_window {
            return Ok(None);
        }

        let window = std::mem::take(&mut self.window);
        self.frames_in_window = 0;
        Ok(self.process_window(&window))
    }

    /// Close an utterance still open when capture ends.
    fn flush(&mut self) -> Option<UtteranceSegment> {
        if self.state != VadState::Speaking {
            return None;
        }
        self.state = VadState::Silent;
        self.silence_counter = 0;
        self.session.clear_interrupt();
        self.take_segment(false)
    }
}
