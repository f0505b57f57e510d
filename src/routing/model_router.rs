//! Model-keyed routing with load-balancer delegation.
//!
//! Looks up the request's model name (taken from the peeked JSON body) in
//! the service's `by_model` table. A hit routes directly; everything else
//! is handed to the round-robin selector.

use std::sync::Arc;
use url::Url;

use crate::config::ServiceConfig;
use crate::routing::round_robin::RoundRobin;
use crate::routing::{RequestContext, Resolution, RouteReason, Strategy};

pub struct ModelRouter {
    load_balancer: Arc<RoundRobin>,
}

impl ModelRouter {
    pub fn new(load_balancer: Arc<RoundRobin>) -> Self {
        Self { load_balancer }
    }
}

impl Strategy for ModelRouter {
    fn name(&self) -> &'static str {
        "model_router"
    }

    fn resolve(
        &self,
        service_id: &str,
        ctx: &RequestContext,
        cfg: &ServiceConfig,
        base_url: &Url,
    ) -> Resolution {
        if let Some(model) = ctx.body_str(&cfg.routing.model_key) {
            if let Some(target) = cfg.routing.by_model.get(model) {
                tracing::debug!(service = %service_id, model = %model, upstream = %target, "Model mapping hit");
                return Resolution {
                    url: target.clone(),
                    reason: RouteReason::MappingHit,
                };
            }
        }

        self.load_balancer.resolve(service_id, ctx, cfg, base_url)
    }
}
