//! Per-service lifecycle state.
//!
//! # States
//! ```text
//! COLD ──trigger──► STARTING ──ready──► HOT ──idle──► STOPPING ──► COLD
//!                      │
//!                      └── terminal failure ──► COLD
//! ```
//!
//! # Design Decisions
//! - Readiness is a separate flag: READY implies HOT, and is cleared
//!   atomically with every transition out of HOT
//! - startup_epoch increments on each COLD→STARTING edge and fences late
//!   completions from superseded startup attempts

use std::time::Instant;
use serde::Serialize;
use url::Url;

/// Operational state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Cold,
    Starting,
    Hot,
    Stopping,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Cold => "cold",
            Lifecycle::Starting => "starting",
            Lifecycle::Hot => "hot",
            Lifecycle::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Whether a hot service is believed to accept traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    NotReady,
    Ready,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Readiness::NotReady => "not_ready",
            Readiness::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Mutable in-memory state of a service, guarded by the entry's lock.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub lifecycle: Lifecycle,
    pub readiness: Readiness,
    /// Monotonic timestamp of the last admission or completed response.
    pub last_activity: Instant,
    /// Incremented on each COLD→STARTING transition.
    pub startup_epoch: u64,
    /// Last terminal startup failure, cleared when a new startup begins.
    pub startup_error: Option<String>,
    /// Base URL override after a successful fallback attempt; cleared on
    /// every transition to COLD.
    pub active_base_url: Option<Url>,
}

impl ServiceState {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Cold,
            readiness: Readiness::NotReady,
            last_activity: Instant::now(),
            startup_epoch: 0,
            startup_error: None,
            active_base_url: None,
        }
    }

    /// Record activity now. `Instant::now()` is monotonic, so
    /// `last_activity` never goes backwards.
    pub fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_is_monotonic() {
        let mut state = ServiceState::new();
        let before = state.last_activity;
        state.touch();
        assert!(state.last_activity >= before);
    }

    #[test]
    fn lifecycle_renders_lowercase() {
        assert_eq!(Lifecycle::Cold.to_string(), "cold");
        assert_eq!(Lifecycle::Starting.to_string(), "starting");
        assert_eq!(Lifecycle::Hot.to_string(), "hot");
        assert_eq!(Lifecycle::Stopping.to_string(), "stopping");
    }
}
