//! Routing strategy subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted request → RequestContext (method, path, headers, JSON peek)
//!     → StrategyRegistry::resolve
//!         → model_router.rs (by_model mapping, else delegate)
//!         → round_robin.rs (healthy-instance rotation)
//!     → Resolution { upstream url, reason }
//!     → proxy forwards and reports the outcome to health.rs
//! ```
//!
//! # Design Decisions
//! - Strategies are registered by name in a map of trait objects;
//!   resolve is called once per request, so dynamic dispatch is off the
//!   byte-copy hot path
//! - Instance health is shared between strategies and updated passively
//!   by the proxy

pub mod health;
pub mod model_router;
pub mod round_robin;

use std::collections::HashMap;
use std::sync::Arc;
use axum::http::{HeaderMap, Method};
use serde::Serialize;
use url::Url;

use crate::config::ServiceConfig;
pub use health::InstanceHealthTracker;
use model_router::ModelRouter;
use round_robin::RoundRobin;

/// Strategy names compiled into the gateway.
pub const BUILTIN_STRATEGIES: &[&str] = &["model_router", "round_robin"];

/// Why a resolution picked its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// A routing-table entry matched the request.
    MappingHit,
    /// The load balancer selected a healthy instance.
    LbSelected,
    /// No usable instance; the service base URL is used.
    FallbackBaseUrl,
    /// Unhealthy instances were skipped while selecting.
    UnhealthySkipped,
}

/// A resolved upstream for one request.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub url: Url,
    pub reason: RouteReason,
}

/// Read-only request facts a strategy may inspect.
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// Shallow parse of a small JSON body, when one was peekable.
    pub body_peek: Option<serde_json::Value>,
}

impl RequestContext {
    /// String value at `key` in the peeked JSON body.
    pub fn body_str(&self, key: &str) -> Option<&str> {
        self.body_peek.as_ref()?.get(key)?.as_str()
    }
}

/// A named routing policy.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick an upstream for the request. `base_url` is the service's
    /// effective base URL (fallback override applied) used when no
    /// instance is viable.
    fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        cfg: &ServiceConfig,
        base_url: &Url,
    ) -> Resolution;
}

/// Name → strategy map plus the shared instance-health tracker.
pub struct StrategyRegistry {
    strategies: HashMap<&'static str, Arc<dyn Strategy>>,
    health: Arc<InstanceHealthTracker>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        let health = Arc::new(InstanceHealthTracker::default());

        let round_robin: Arc<RoundRobin> = Arc::new(RoundRobin::new(health.clone()));
        let model_router = Arc::new(ModelRouter::new(round_robin.clone()));

        let mut strategies: HashMap<&'static str, Arc<dyn Strategy>> = HashMap::new();
        strategies.insert(round_robin.name(), round_robin.clone());
        strategies.insert(model_router.name(), model_router);

        Self { strategies, health }
    }

    /// Resolve the upstream for a request. A service with no strategy
    /// goes straight to its base URL.
    pub fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        cfg: &ServiceConfig,
        base_url: &Url,
    ) -> Resolution {
        let Some(name) = cfg.strategy.as_deref() else {
            return Resolution {
                url: base_url.clone(),
                reason: RouteReason::FallbackBaseUrl,
            };
        };

        match self.strategies.get(name) {
            Some(strategy) => strategy.resolve(service_id, ctx, cfg, base_url),
            None => {
                // Validation rejects unknown names; a stale entry can only
                // appear mid-reload.
                tracing::warn!(service = %service_id, strategy = %name, "Unknown strategy, using base URL");
                Resolution {
                    url: base_url.clone(),
                    reason: RouteReason::FallbackBaseUrl,
                }
            }
        }
    }

    pub fn health(&self) -> &Arc<InstanceHealthTracker> {
        &self.health
    }

    /// Loaded strategy names, for the listing endpoint.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.strategies.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn context(method: Method, body: Option<serde_json::Value>) -> RequestContext {
        RequestContext {
            method,
            path: "/x".to_string(),
            query: None,
            headers: HeaderMap::new(),
            body_peek: body,
        }
    }
}
