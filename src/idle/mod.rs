//! Idle monitor.
//!
//! # Responsibilities
//! - Sweep all services at a coarse cadence
//! - Demote HOT services whose inactivity exceeded their idle timeout
//! - Leave services with `idle_timeout_ms = 0` alone
//!
//! # Design Decisions
//! - A single background task handles every service; the per-service
//!   stop transition itself lives in the startup orchestrator so the
//!   stop endpoint shares it
//! - The sweep reads state under the service lock but performs the remote
//!   stop outside it

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::registry::state::Lifecycle;
use crate::registry::ServiceRegistry;
use crate::startup::StartupOrchestrator;

pub struct IdleMonitor {
    registry: Arc<ServiceRegistry>,
    orchestrator: Arc<StartupOrchestrator>,
    sweep_interval: Duration,
}

impl IdleMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        orchestrator: Arc<StartupOrchestrator>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            sweep_interval,
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_ms = self.sweep_interval.as_millis() as u64, "Idle monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sweep_interval) => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Idle monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    async fn sweep(&self) {
        for entry in self.registry.list() {
            let cfg = entry.config();
            if cfg.idle_timeout_ms == 0 {
                continue;
            }

            let idle_for = Duration::from_millis(cfg.idle_timeout_ms);
            let expired = entry.update_state(|state| {
                state.lifecycle == Lifecycle::Hot && state.last_activity.elapsed() >= idle_for
            });
            if !expired {
                continue;
            }

            tracing::info!(
                service = %entry.id,
                idle_timeout_ms = cfg.idle_timeout_ms,
                "Idle timeout reached, shutting service down"
            );
            self.orchestrator.stop_service(&entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::lifecycle::Shutdown;
    use crate::registry::state::Readiness;

    fn setup(yaml: &str) -> (Arc<ServiceRegistry>, Arc<StartupOrchestrator>) {
        let mut config = GatewayConfig::default();
        config
            .services
            .insert("svc-a".to_string(), serde_yaml::from_str(yaml).unwrap());
        let registry = Arc::new(ServiceRegistry::new(&config));
        let orchestrator = Arc::new(StartupOrchestrator::new(None, None, Shutdown::new()));
        (registry, orchestrator)
    }

    #[tokio::test]
    async fn hot_service_goes_cold_after_idle_timeout() {
        let (registry, orchestrator) =
            setup("base_url: \"http://127.0.0.1:9000\"\nidle_timeout_ms: 50\n");
        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| {
            s.lifecycle = Lifecycle::Hot;
            s.readiness = Readiness::Ready;
            s.touch();
        });

        let shutdown = Shutdown::new();
        let monitor = IdleMonitor::new(
            registry.clone(),
            orchestrator,
            Duration::from_millis(20),
        );
        tokio::spawn(monitor.run(shutdown.subscribe()));

        for _ in 0..100 {
            if entry.state_snapshot().lifecycle == Lifecycle::Cold {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let state = entry.state_snapshot();
        assert_eq!(state.lifecycle, Lifecycle::Cold);
        assert_eq!(state.readiness, Readiness::NotReady);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn zero_idle_timeout_never_demotes() {
        let (registry, orchestrator) =
            setup("base_url: \"http://127.0.0.1:9000\"\nidle_timeout_ms: 0\n");
        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| {
            s.lifecycle = Lifecycle::Hot;
            s.readiness = Readiness::Ready;
        });

        let shutdown = Shutdown::new();
        let monitor = IdleMonitor::new(
            registry.clone(),
            orchestrator,
            Duration::from_millis(10),
        );
        tokio::spawn(monitor.run(shutdown.subscribe()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(entry.state_snapshot().lifecycle, Lifecycle::Hot);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn activity_defers_demotion() {
        let (registry, orchestrator) =
            setup("base_url: \"http://127.0.0.1:9000\"\nidle_timeout_ms: 200\n");
        let entry = registry.get("svc-a").unwrap();
        entry.update_state(|s| {
            s.lifecycle = Lifecycle::Hot;
            s.readiness = Readiness::Ready;
            s.touch();
        });

        let shutdown = Shutdown::new();
        let monitor = IdleMonitor::new(
            registry.clone(),
            orchestrator,
            Duration::from_millis(20),
        );
        tokio::spawn(monitor.run(shutdown.subscribe()));

        // Keep touching for a while; the service must stay hot.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            entry.touch();
            assert_eq!(entry.state_snapshot().lifecycle, Lifecycle::Hot);
        }
        shutdown.trigger();
    }
}
