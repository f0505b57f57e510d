//! Per-service bounded FIFO request queue.
//!
//! # Data Flow
//! ```text
//! Request finds service not ready
//!     → enqueue() (atomic capacity check)
//!     → waiter parks on a single-shot completion channel
//!     → startup orchestrator drains the queue on the readiness edge
//!       (Proceed) or on terminal failure (StartupFailed)
//!     → waiter resumes and proxies, or maps the signal to a status code
//! ```
//!
//! # Design Decisions
//! - One single-shot channel per entry keeps back-pressure observable;
//!   no shared unbounded channel
//! - The per-entry deadline is enforced by the waiter, not the queue;
//!   abandoned entries are reclaimed lazily on the next queue operation
//! - Admission never spin-waits: at capacity the caller is rejected

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Outcome delivered to a parked request.
#[derive(Debug, Clone, PartialEq)]
pub enum ReleaseSignal {
    /// The service is ready; resolve an upstream and proxy.
    Proceed,
    /// Startup exhausted all attempts; carries the terminal error.
    StartupFailed(String),
    /// The entry was evicted (queue capacity shrank below its position).
    Rejected,
    /// The gateway is stopping.
    GatewayShutdown,
}

/// Result of an admission attempt.
pub enum EnqueueOutcome {
    /// Entry parked; await the receiver for a release signal.
    Admitted(oneshot::Receiver<ReleaseSignal>),
    /// Queue is at capacity.
    RejectedFull,
}

struct Parked {
    tx: oneshot::Sender<ReleaseSignal>,
}

/// Bounded FIFO of parked requests for a single service.
pub struct RequestQueue {
    inner: Mutex<VecDeque<Parked>>,
    capacity: AtomicUsize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Admit an entry, or reject it when the queue is at capacity.
    ///
    /// The capacity check and the insertion happen under one lock
    /// acquisition. Entries whose waiter already gave up (dropped receiver)
    /// are pruned first so their slots are reusable.
    pub fn enqueue(&self) -> EnqueueOutcome {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|p| !p.tx.is_closed());

        if inner.len() >= self.capacity.load(Ordering::Relaxed) {
            return EnqueueOutcome::RejectedFull;
        }

        let (tx, rx) = oneshot::channel();
        inner.push_back(Parked { tx });
        EnqueueOutcome::Admitted(rx)
    }

    /// Deliver `signal` to every parked entry in FIFO order and empty the
    /// queue.
    pub fn drain_all(&self, signal: ReleaseSignal) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0;
        while let Some(parked) = inner.pop_front() {
            if parked.tx.send(signal.clone()).is_ok() {
                released += 1;
            }
        }
        released
    }

    /// Deliver GatewayShutdown to all entries.
    pub fn shutdown(&self) -> usize {
        self.drain_all(ReleaseSignal::GatewayShutdown)
    }

    /// Number of live parked entries.
    pub fn pending(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|p| !p.tx.is_closed());
        inner.len()
    }

    /// Apply a new capacity. When the queue is deeper than the new bound,
    /// the newest entries are evicted with a Rejected signal; the oldest
    /// keep their slots.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|p| !p.tx.is_closed());
        while inner.len() > capacity {
            if let Some(parked) = inner.pop_back() {
                let _ = parked.tx.send(ReleaseSignal::Rejected);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity_then_rejects() {
        let queue = RequestQueue::new(2);

        let r1 = queue.enqueue();
        let r2 = queue.enqueue();
        let r3 = queue.enqueue();

        assert!(matches!(r1, EnqueueOutcome::Admitted(_)));
        assert!(matches!(r2, EnqueueOutcome::Admitted(_)));
        assert!(matches!(r3, EnqueueOutcome::RejectedFull));
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test]
    async fn drain_releases_in_fifo_order() {
        let queue = RequestQueue::new(4);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            match queue.enqueue() {
                EnqueueOutcome::Admitted(rx) => receivers.push(rx),
                EnqueueOutcome::RejectedFull => panic!("queue unexpectedly full"),
            }
        }

        assert_eq!(queue.drain_all(ReleaseSignal::Proceed), 3);
        assert_eq!(queue.pending(), 0);

        for rx in receivers {
            assert_eq!(rx.await.unwrap(), ReleaseSignal::Proceed);
        }
    }

    #[test]
    fn abandoned_entries_free_their_slots() {
        let queue = RequestQueue::new(1);

        let rx = match queue.enqueue() {
            EnqueueOutcome::Admitted(rx) => rx,
            EnqueueOutcome::RejectedFull => panic!("queue unexpectedly full"),
        };
        assert!(matches!(queue.enqueue(), EnqueueOutcome::RejectedFull));

        // Waiter times out and drops its receiver.
        drop(rx);
        assert!(matches!(queue.enqueue(), EnqueueOutcome::Admitted(_)));
    }

    #[tokio::test]
    async fn shrink_evicts_newest_first() {
        let queue = RequestQueue::new(3);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            match queue.enqueue() {
                EnqueueOutcome::Admitted(rx) => receivers.push(rx),
                EnqueueOutcome::RejectedFull => panic!("queue unexpectedly full"),
            }
        }

        queue.set_capacity(1);
        assert_eq!(queue.pending(), 1);

        let newest = receivers.pop().unwrap();
        let middle = receivers.pop().unwrap();
        let oldest = receivers.pop().unwrap();

        assert_eq!(newest.await.unwrap(), ReleaseSignal::Rejected);
        assert_eq!(middle.await.unwrap(), ReleaseSignal::Rejected);

        queue.drain_all(ReleaseSignal::Proceed);
        assert_eq!(oldest.await.unwrap(), ReleaseSignal::Proceed);
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_entries() {
        let queue = RequestQueue::new(2);
        let rx = match queue.enqueue() {
            EnqueueOutcome::Admitted(rx) => rx,
            EnqueueOutcome::RejectedFull => panic!("queue unexpectedly full"),
        };

        queue.shutdown();
        assert_eq!(rx.await.unwrap(), ReleaseSignal::GatewayShutdown);
    }
}
