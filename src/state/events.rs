//! Boolean condition events shared between pipeline stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A set/clear/wait boolean event.
///
/// Setting an already-set event and clearing an already-clear event are
/// no-ops. Waiters are woken on `set`; a waiter that arrives after the
/// event was set returns immediately.
#[derive(Debug, Default)]
pub struct Event {
    flag: AtomicBool,
    notify: Notify,
}

impl Event {
    /// Create a new, cleared event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Clear the event.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether the event is currently set.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until the event is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            // Register interest before re-checking so a set() between the
            // check and the await cannot be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// The monitor-owned signals every downstream stage reads.
///
/// These are orthogonal controls, distinct from the dropped-answer set:
/// *silence-over-threshold* gates playback start, *user-still-speaking*
/// marks barge-in for the next stage checkpoint.
#[derive(Debug, Default)]
pub struct PipelineSignals {
    /// The user has been silent for at least the user-silence threshold.
    pub silence_over_threshold: Event,
    /// The user kept talking after the current utterance was dispatched.
    pub user_still_speaking: Event,
}

impl PipelineSignals {
    /// Create a fresh signal set, all events cleared.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
