//! Graceful shutdown orchestration.
//!
//! # Shutdown Sequence
//! 1. Stop admitting new requests (503 + Retry-After)
//! 2. Drain parked queue entries with a shutdown signal
//! 3. Give in-flight proxy requests a grace period to flush
//! 4. Stop background tasks
//! 5. Exit

use tokio::sync::broadcast;

/// Broadcast handle used to fan a shutdown signal out to every task.
///
/// Cloning is cheap; each background task holds a receiver and selects on
/// it at its poll boundaries.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Obtain a receiver for the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signal shutdown to all subscribers.
    pub fn trigger(&self) {
        // Send fails only when no receiver is alive, which is fine.
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
