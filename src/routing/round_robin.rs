//! Health-aware round-robin selection over a service's instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use dashmap::DashMap;
use url::Url;

use crate::config::ServiceConfig;
use crate::routing::health::InstanceHealthTracker;
use crate::routing::{RequestContext, Resolution, RouteReason, Strategy};

/// Round-robin selector with one rotation cursor per service.
pub struct RoundRobin {
    cursors: DashMap<String, Arc<AtomicUsize>>,
    health: Arc<InstanceHealthTracker>,
}

impl RoundRobin {
    pub fn new(health: Arc<InstanceHealthTracker>) -> Self {
        Self {
            cursors: DashMap::new(),
            health,
        }
    }

    fn cursor(&self, service_id: &str) -> Arc<AtomicUsize> {
        self.cursors
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .value()
            .clone()
    }
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn resolve(
        &self,
        service_id: &str,
        _ctx: &RequestContext,
        cfg: &ServiceConfig,
        base_url: &Url,
    ) -> Resolution {
        if cfg.instances.is_empty() {
            return Resolution {
                url: base_url.clone(),
                reason: RouteReason::FallbackBaseUrl,
            };
        }

        let start = self.cursor(service_id).fetch_add(1, Ordering::Relaxed);
        let len = cfg.instances.len();

        // Insertion order breaks ties between equally healthy instances.
        let mut skipped = 0;
        for i in 0..len {
            let instance = &cfg.instances[(start + i) % len];
            if self.health.is_healthy(&instance.url) {
                let reason = if skipped == 0 {
                    RouteReason::LbSelected
                } else {
                    RouteReason::UnhealthySkipped
                };
                return Resolution {
                    url: instance.url.clone(),
                    reason,
                };
            }
            skipped += 1;
        }

        // Every instance is unhealthy: try the least-recently-failed one
        // anyway rather than refusing outright.
        let urls: Vec<Url> = cfg.instances.iter().map(|i| i.url.clone()).collect();
        match self.health.least_recently_failed(&urls) {
            Some(url) => Resolution {
                url: url.clone(),
                reason: RouteReason::UnhealthySkipped,
            },
            None => Resolution {
                url: base_url.clone(),
                reason: RouteReason::FallbackBaseUrl,
            },
        }
    }
}
