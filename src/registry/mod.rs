//! Service registry: the source of truth for per-service config and state.
//!
//! # Data Flow
//! ```text
//! Request arrives with a service id
//!     → get() / get_or_synthesize() (unknown ids may inherit the
//!       configured default service's template)
//!     → update_state() runs a closure under the per-service lock
//!     → startup / idle / proxy observe and mutate the snapshot
//!
//! On config reload:
//!     apply_config() swaps each service's config atomically and
//!     shrinks queues whose capacity dropped below their depth
//! ```
//!
//! # Design Decisions
//! - One entry per service id; entries are shared as Arcs and never
//!   removed while a request may hold them
//! - The state lock is synchronous and never held across I/O
//! - Config is swapped via ArcSwap so readers never block on reload

pub mod state;

use std::sync::{Arc, Mutex};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use url::Url;

use crate::config::{GatewayConfig, ServiceConfig};
use crate::queue::RequestQueue;
use state::{Lifecycle, Readiness, ServiceState};

/// A service's configuration, live state, and queue.
pub struct ServiceEntry {
    pub id: String,
    config: ArcSwap<ServiceConfig>,
    state: Mutex<ServiceState>,
    pub queue: RequestQueue,
    /// True when the entry was synthesized from the default template for
    /// an unknown id.
    pub synthetic: bool,
}

impl ServiceEntry {
    fn new(id: String, config: ServiceConfig, synthetic: bool) -> Self {
        let queue = RequestQueue::new(config.queue_size);
        Self {
            id,
            config: ArcSwap::from_pointee(config),
            state: Mutex::new(ServiceState::new()),
            queue,
            synthetic,
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ServiceConfig> {
        self.config.load_full()
    }

    /// Run `f` under the per-service state lock.
    ///
    /// The closure must not block: the lock is synchronous and shared with
    /// the request path.
    pub fn update_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut ServiceState) -> R,
    {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Read-only state snapshot.
    pub fn state_snapshot(&self) -> ServiceState {
        self.state.lock().unwrap().clone()
    }

    /// Record request activity now.
    pub fn touch(&self) {
        self.update_state(|s| s.touch());
    }

    /// Base URL requests should currently target: the fallback override
    /// when one is active, the configured base URL otherwise.
    pub fn effective_base_url(&self) -> Url {
        let override_url = self.update_state(|s| s.active_base_url.clone());
        override_url.unwrap_or_else(|| self.config().base_url.clone())
    }

    fn apply_new_config(&self, config: ServiceConfig) {
        self.queue.set_capacity(config.queue_size);
        self.config.store(Arc::new(config));
    }
}

/// Holds the map `service_id → entry` plus the default-service template.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
    default_service: Mutex<Option<String>>,
}

impl ServiceRegistry {
    pub fn new(config: &GatewayConfig) -> Self {
        let registry = Self {
            services: DashMap::new(),
            default_service: Mutex::new(config.default_service.clone()),
        };
        for (id, svc) in &config.services {
            registry.services.insert(
                id.clone(),
                Arc::new(ServiceEntry::new(id.clone(), svc.clone(), false)),
            );
        }
        registry
    }

    /// Look up a known service.
    pub fn get(&self, id: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(id).map(|e| e.value().clone())
    }

    /// Look up a service, synthesizing an entry from the default service's
    /// template for unknown ids. The synthesized id still namespaces its
    /// own state and queue.
    pub fn get_or_synthesize(&self, id: &str) -> Option<Arc<ServiceEntry>> {
        if let Some(entry) = self.get(id) {
            return Some(entry);
        }

        let template = {
            let default = self.default_service.lock().unwrap();
            default.as_ref().and_then(|d| self.get(d))
        }?;

        let entry = self
            .services
            .entry(id.to_string())
            .or_insert_with(|| {
                tracing::info!(service = %id, template = %template.id, "Synthesizing unknown service from default template");
                Arc::new(ServiceEntry::new(
                    id.to_string(),
                    (*template.config()).clone(),
                    true,
                ))
            })
            .value()
            .clone();
        Some(entry)
    }

    /// All live entries, configured and synthetic.
    pub fn list(&self) -> Vec<Arc<ServiceEntry>> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    /// Apply a reloaded configuration. Existing state is preserved; queue
    /// capacities shrink (evicting the newest entries) when the new config
    /// lowers them. Services removed from the config are dropped after
    /// their queues are drained.
    pub fn apply_config(&self, config: &GatewayConfig) {
        *self.default_service.lock().unwrap() = config.default_service.clone();

        for (id, svc) in &config.services {
            match self.services.get(id) {
                Some(entry) => entry.apply_new_config(svc.clone()),
                None => {
                    self.services.insert(
                        id.clone(),
                        Arc::new(ServiceEntry::new(id.clone(), svc.clone(), false)),
                    );
                }
            }
        }

        let removed: Vec<String> = self
            .services
            .iter()
            .filter(|e| !e.value().synthetic && !config.services.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for id in removed {
            if let Some((_, entry)) = self.services.remove(&id) {
                let dropped = entry.queue.drain_all(crate::queue::ReleaseSignal::Rejected);
                tracing::info!(service = %id, dropped = dropped, "Service removed from configuration");
            }
        }
    }

    /// Drain every queue with a shutdown signal.
    pub fn shutdown_all(&self) {
        for entry in self.services.iter() {
            let drained = entry.value().queue.shutdown();
            if drained > 0 {
                tracing::info!(service = %entry.key(), drained = drained, "Drained queue on shutdown");
            }
        }
    }
}

/// True when the service may proxy immediately without queueing.
pub fn is_ready(state: &ServiceState) -> bool {
    state.lifecycle == Lifecycle::Hot && state.readiness == Readiness::Ready
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(services: &[(&str, &str)]) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        for (id, url) in services {
            config.services.insert(
                id.to_string(),
                serde_yaml::from_str(&format!("base_url: \"{}\"", url)).unwrap(),
            );
        }
        config
    }

    #[test]
    fn unknown_id_without_default_is_none() {
        let registry = ServiceRegistry::new(&config_with(&[("svc-a", "http://127.0.0.1:9000")]));
        assert!(registry.get_or_synthesize("ghost").is_none());
    }

    #[test]
    fn unknown_id_inherits_default_template() {
        let mut config = config_with(&[("svc-a", "http://127.0.0.1:9000")]);
        config.default_service = Some("svc-a".into());
        let registry = ServiceRegistry::new(&config);

        let entry = registry.get_or_synthesize("ghost").unwrap();
        assert!(entry.synthetic);
        assert_eq!(entry.config().base_url.as_str(), "http://127.0.0.1:9000/");

        // Same entry on repeat lookups: state is namespaced by id.
        let again = registry.get_or_synthesize("ghost").unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
    }

    #[test]
    fn reload_shrinks_queue_capacity() {
        let mut config = config_with(&[("svc-a", "http://127.0.0.1:9000")]);
        let registry = ServiceRegistry::new(&config);
        let entry = registry.get("svc-a").unwrap();
        assert_eq!(entry.queue.capacity(), 16);

        config.services.get_mut("svc-a").unwrap().queue_size = 2;
        registry.apply_config(&config);
        assert_eq!(entry.queue.capacity(), 2);
        assert_eq!(entry.config().queue_size, 2);
    }

    #[test]
    fn reload_preserves_state() {
        let config = config_with(&[("svc-a", "http://127.0.0.1:9000")]);
        let registry = ServiceRegistry::new(&config);
        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| {
            s.lifecycle = Lifecycle::Hot;
            s.readiness = Readiness::Ready;
            s.startup_epoch = 7;
        });

        registry.apply_config(&config);

        let entry = registry.get("svc-a").unwrap();
        let state = entry.state_snapshot();
        assert_eq!(state.lifecycle, Lifecycle::Hot);
        assert_eq!(state.startup_epoch, 7);
    }

    #[test]
    fn effective_base_url_prefers_fallback_override() {
        let config = config_with(&[("svc-a", "http://primary:9000")]);
        let registry = ServiceRegistry::new(&config);
        let entry = registry.get("svc-a").unwrap();

        assert_eq!(entry.effective_base_url().as_str(), "http://primary:9000/");
        entry.update_state(|s| {
            s.active_base_url = Some("http://fallback:9000".parse().unwrap())
        });
        assert_eq!(entry.effective_base_url().as_str(), "http://fallback:9000/");
    }
}
