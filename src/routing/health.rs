//! Per-instance upstream health tracking.
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= threshold (default 3)
//! Unhealthy → Healthy: next 2xx/3xx response
//! ```
//!
//! Health is observed passively by the proxy: a 2xx/3xx response marks the
//! instance healthy, a transport error or >=500 response counts a failure.

use std::time::Instant;
use dashmap::DashMap;
use url::Url;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Health record for a single instance URL.
#[derive(Debug, Clone)]
pub struct InstanceHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_probe_at: Instant,
}

impl InstanceHealth {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_probe_at: Instant::now(),
        }
    }
}

/// Shared tracker keyed by instance URL.
pub struct InstanceHealthTracker {
    instances: DashMap<String, InstanceHealth>,
    failure_threshold: u32,
}

impl InstanceHealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            instances: DashMap::new(),
            failure_threshold,
        }
    }

    /// Record a successful response. Resets the failure streak.
    pub fn report_success(&self, url: &Url) {
        let mut entry = self
            .instances
            .entry(url.to_string())
            .or_insert_with(InstanceHealth::new);
        let was_unhealthy = !entry.healthy;
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_probe_at = Instant::now();
        if was_unhealthy {
            tracing::info!(instance = %url, "Instance recovered");
        }
    }

    /// Record a transport error or >=500 response.
    pub fn report_failure(&self, url: &Url) {
        let mut entry = self
            .instances
            .entry(url.to_string())
            .or_insert_with(InstanceHealth::new);
        entry.consecutive_failures += 1;
        entry.last_probe_at = Instant::now();
        if entry.healthy && entry.consecutive_failures >= self.failure_threshold {
            entry.healthy = false;
            tracing::warn!(
                instance = %url,
                failures = entry.consecutive_failures,
                "Instance marked unhealthy"
            );
        }
    }

    /// Instances with no recorded outcome yet count as healthy.
    pub fn is_healthy(&self, url: &Url) -> bool {
        self.instances
            .get(url.as_str())
            .map(|e| e.healthy)
            .unwrap_or(true)
    }

    /// Of the given URLs, the one whose last failure is oldest. Used when
    /// every instance is unhealthy and one must be tried anyway.
    /// Untracked instances sort first (None < Some).
    pub fn least_recently_failed<'a>(&self, urls: &'a [Url]) -> Option<&'a Url> {
        urls.iter()
            .min_by_key(|u| self.instances.get(u.as_str()).map(|e| e.last_probe_at))
    }

    /// Snapshot for the status surface.
    pub fn snapshot(&self, url: &Url) -> Option<InstanceHealth> {
        self.instances.get(url.as_str()).map(|e| e.clone())
    }
}

impl Default for InstanceHealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        s.parse().unwrap()
    }

    #[test]
    fn threshold_marks_unhealthy() {
        let tracker = InstanceHealthTracker::new(3);
        let u = url("http://10.0.0.1:9000");

        tracker.report_failure(&u);
        tracker.report_failure(&u);
        assert!(tracker.is_healthy(&u));

        tracker.report_failure(&u);
        assert!(!tracker.is_healthy(&u));
    }

    #[test]
    fn success_resets_streak() {
        let tracker = InstanceHealthTracker::new(3);
        let u = url("http://10.0.0.1:9000");

        tracker.report_failure(&u);
        tracker.report_failure(&u);
        tracker.report_success(&u);
        tracker.report_failure(&u);
        tracker.report_failure(&u);
        assert!(tracker.is_healthy(&u));
    }

    #[test]
    fn recovery_on_next_success() {
        let tracker = InstanceHealthTracker::new(1);
        let u = url("http://10.0.0.1:9000");

        tracker.report_failure(&u);
        assert!(!tracker.is_healthy(&u));
        tracker.report_success(&u);
        assert!(tracker.is_healthy(&u));
    }

    #[test]
    fn least_recently_failed_prefers_oldest_failure() {
        let tracker = InstanceHealthTracker::new(1);
        let u1 = url("http://10.0.0.1:9000");
        let u2 = url("http://10.0.0.2:9000");

        tracker.report_failure(&u1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        tracker.report_failure(&u2);

        let urls = vec![u1.clone(), u2];
        assert_eq!(tracker.least_recently_failed(&urls), Some(&u1));
    }
}
