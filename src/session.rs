//! Session-scoped interrupt context shared by every stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The barge-in flag for one conversation session.
///
/// Written by the VAD stage, read by everything downstream before it commits
/// irreversible work. Cloning is cheap and every clone observes the same flag.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    interrupted: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the user is currently talking over the agent.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn signal_interrupt(&self) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            tracing::debug!("interrupt signalled");
        }
    }

    pub fn clear_interrupt(&self) {
        if self.interrupted.swap(false, Ordering::SeqCst) {
            tracing::debug!("interrupt cleared");
        }
    }
}
