//! Text batcher: coalesces sentences into synthesis requests.

use crate::config::LiveSettings;
use crate::pipeline::types::{SeqNo, SpeechRequest, TextBatch, TurnId};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// What the batcher produced.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Batch(TextBatch),
    /// The orchestrator closed `turn`; everything before it has been batched.
    EndTurn(TurnId),
    Shutdown,
}

/// Pulls sentences and groups the ones arriving within one delay window.
///
/// The window starts at `batch_delay_floor` for the first batch of a turn
/// and whenever nothing is playing, then grows by `batch_delay_growth` per
/// batch up to `batch_delay_ceiling`. Sentences of different turns are never
/// combined.
pub struct TextBatcher {
    rx: Receiver<SpeechRequest>,
    settings: LiveSettings,
    talking: Arc<AtomicBool>,
    held: Option<SpeechRequest>,
    turn: TurnId,
    next_seq: SeqNo,
    delay: Duration,
}

impl TextBatcher {
    /// `talking` is raised by playback while audio is going out.
    pub fn new(rx: Receiver<SpeechRequest>, settings: LiveSettings, talking: Arc<AtomicBool>) -> Self {
        let delay = settings.snapshot().batch_delay_floor;
        Self {
            rx,
            settings,
            talking,
            held: None,
            turn: 0,
            next_seq: 1,
            delay,
        }
    }

    /// Current collection window.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Block until the next batch, turn end or shutdown.
    pub fn next_batch(&mut self) -> BatchEvent {
        let first = match self.held.take() {
            Some(request) => request,
            None => match self.rx.recv() {
                Ok(request) => request,
                Err(_) => return BatchEvent::Shutdown,
            },
        };

        let (turn, mut text) = match first {
            SpeechRequest::Shutdown => return BatchEvent::Shutdown,
            SpeechRequest::EndTurn { turn } => return BatchEvent::EndTurn(turn),
            SpeechRequest::Text { turn, text } => (turn, text),
        };

        let tunables = self.settings.snapshot();
        if turn != self.turn {
            self.turn = turn;
            self.next_seq = 1;
            self.delay = tunables.batch_delay_floor;
        }
        if !self.talking.load(Ordering::SeqCst) {
            self.delay = tunables.batch_delay_floor;
        }

        let deadline = Instant::now() + self.delay;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(SpeechRequest::Text { turn: t, text: more }) if t == turn => {
                    text.push(' ');
                    text.push_str(&more);
                }
                Ok(SpeechRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!(turn, "shutdown during batch window, dropping partial batch");
                    return BatchEvent::Shutdown;
                }
                Ok(other) => {
                    self.held = Some(other);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let grown_us = (self.delay.as_micros() as f64 * tunables.batch_delay_growth as f64).round();
        self.delay = Duration::from_micros(grown_us as u64)
            .min(tunables.batch_delay_ceiling)
            .max(tunables.batch_delay_floor);

        tracing::debug!(turn, seq, chars = text.len(), "batch ready");
        BatchEvent::Batch(TextBatch { turn, seq, text })
    }
}
