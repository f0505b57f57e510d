//! Startup orchestration.
//!
//! # Data Flow
//! ```text
//! COLD ──trigger──► STARTING ──ready──► HOT (READY), queue drained PROCEED
//!                      │
//!                      └── all attempts + fallback fail ──► COLD,
//!                          queue drained STARTUP_FAILED
//! ```
//!
//! # Design Decisions
//! - Single-flight per service: the COLD→STARTING edge and the epoch
//!   increment happen together under the service lock
//! - Completions are fenced by startup_epoch, so a superseded attempt can
//!   never flip state it no longer owns
//! - The remote executor and readiness probes run outside the lock;
//!   cancellation is observed at every poll boundary

pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::queue::ReleaseSignal;
use crate::registry::state::{Lifecycle, Readiness};
use crate::registry::ServiceEntry;
use crate::remote::{await_task, RemoteExecutor};
use crate::store::MetadataStore;
use probe::{await_ready, rebase_health_url, ProbeError, ReadinessPolicy};

/// Serializes startup per service and applies the retry → fallback →
/// error policy.
pub struct StartupOrchestrator {
    executor: Option<Arc<dyn RemoteExecutor>>,
    probe_client: reqwest::Client,
    store: Option<Arc<MetadataStore>>,
    shutdown: Shutdown,
}

impl StartupOrchestrator {
    pub fn new(
        executor: Option<Arc<dyn RemoteExecutor>>,
        store: Option<Arc<MetadataStore>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            executor,
            probe_client: reqwest::Client::new(),
            store,
            shutdown,
        }
    }

    /// Trigger a startup for the service unless one is already running.
    ///
    /// Returns true when this call claimed the COLD→STARTING edge. Callers
    /// that find the flag already set simply enqueue without re-triggering.
    pub fn trigger(self: &Arc<Self>, entry: &Arc<ServiceEntry>) -> bool {
        let claimed_epoch = entry.update_state(|state| {
            if state.lifecycle != Lifecycle::Cold {
                return None;
            }
            state.lifecycle = Lifecycle::Starting;
            state.readiness = Readiness::NotReady;
            state.startup_epoch += 1;
            state.startup_error = None;
            Some(state.startup_epoch)
        });

        let Some(epoch) = claimed_epoch else {
            return false;
        };

        tracing::info!(service = %entry.id, epoch = epoch, "Startup triggered");
        metrics::record_lifecycle(&entry.id, Lifecycle::Starting);

        let orchestrator = self.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            orchestrator.run_startup(entry, epoch).await;
        });
        true
    }

    async fn run_startup(self: Arc<Self>, entry: Arc<ServiceEntry>, epoch: u64) {
        let cfg = entry.config();
        let started = Instant::now();
        let mut cancel = self.shutdown.subscribe();

        let mut first_error: Option<String> = None;
        let mut last_error = String::from("startup never attempted");

        let attempts = cfg.retry_count.max(1);
        for attempt in 1..=attempts {
            if !self.still_owns(&entry, epoch) {
                return;
            }

            match self.attempt(&entry, cfg.health_url.as_ref(), &mut cancel).await {
                Ok(()) => {
                    self.complete_success(&entry, epoch, None, started);
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    self.abort_cancelled(&entry, epoch);
                    return;
                }
                Err(AttemptError::Failed(reason)) => {
                    tracing::warn!(
                        service = %entry.id,
                        epoch = epoch,
                        attempt = attempt,
                        error = %reason,
                        "Startup attempt failed"
                    );
                    first_error.get_or_insert_with(|| reason.clone());
                    last_error = reason;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(jittered(cfg.retry_delay_ms)) => {}
                    _ = cancel.recv() => {
                        self.abort_cancelled(&entry, epoch);
                        return;
                    }
                }
            }
        }

        if let Some(fallback_url) = cfg.fallback_url.clone() {
            if !self.still_owns(&entry, epoch) {
                return;
            }
            tracing::info!(service = %entry.id, epoch = epoch, fallback = %fallback_url, "Primary attempts exhausted, trying fallback");

            let fallback_health = cfg
                .health_url
                .as_ref()
                .map(|h| rebase_health_url(h, &fallback_url));
            match self
                .probe_readiness(&entry, fallback_health.as_ref(), &mut cancel)
                .await
            {
                Ok(()) => {
                    self.complete_success(&entry, epoch, Some(fallback_url), started);
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    self.abort_cancelled(&entry, epoch);
                    return;
                }
                Err(AttemptError::Failed(reason)) => {
                    tracing::warn!(service = %entry.id, epoch = epoch, error = %reason, "Fallback attempt failed");
                    last_error = reason;
                }
            }
        }

        if let Some(first) = first_error {
            if first != last_error {
                tracing::warn!(service = %entry.id, epoch = epoch, first_error = %first, "First startup error for reference");
            }
        }
        self.complete_failure(&entry, epoch, last_error, started);
    }

    /// One primary attempt: remote start (when configured) followed by the
    /// readiness probe against the primary target.
    async fn attempt(
        &self,
        entry: &Arc<ServiceEntry>,
        health_url: Option<&Url>,
        cancel: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), AttemptError> {
        let cfg = entry.config();

        if let Some(remote) = cfg.remote.as_ref().filter(|r| r.enabled) {
            let Some(executor) = self.executor.as_ref() else {
                return Err(AttemptError::Failed(
                    "remote start requested but no executor is configured".to_string(),
                ));
            };

            let empty_params = HashMap::new();
            let submit = executor.start(
                &entry.id,
                &remote.machine_id,
                &remote.start_template_id,
                &empty_params,
            );
            let task = tokio::select! {
                result = submit => result.map_err(|e| AttemptError::Failed(e.to_string()))?,
                _ = cancel.recv() => return Err(AttemptError::Cancelled),
            };

            let wait = await_task(
                executor.as_ref(),
                &task,
                Duration::from_secs(remote.poll_interval_s),
                Duration::from_secs(remote.task_timeout_s),
            );
            tokio::select! {
                result = wait => result.map_err(|e| AttemptError::Failed(e.to_string()))?,
                _ = cancel.recv() => return Err(AttemptError::Cancelled),
            }
        }

        self.probe_readiness(entry, health_url, cancel).await
    }

    async fn probe_readiness(
        &self,
        entry: &Arc<ServiceEntry>,
        health_url: Option<&Url>,
        cancel: &mut tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), AttemptError> {
        let cfg = entry.config();
        let deadline = Instant::now() + Duration::from_secs(cfg.request_timeout_seconds);

        let policy = match health_url {
            Some(url) => ReadinessPolicy::HealthPoll {
                health_url: url,
                poll_interval: Duration::from_millis(cfg.health_poll_interval_ms),
            },
            None => ReadinessPolicy::Warmup(Duration::from_millis(cfg.warmup_ms)),
        };

        match await_ready(&self.probe_client, policy, deadline, cancel).await {
            Ok(()) => Ok(()),
            Err(ProbeError::Cancelled) => Err(AttemptError::Cancelled),
            Err(ProbeError::Unready(reason)) => Err(AttemptError::Failed(reason)),
        }
    }

    fn still_owns(&self, entry: &Arc<ServiceEntry>, epoch: u64) -> bool {
        entry.update_state(|state| {
            state.startup_epoch == epoch && state.lifecycle == Lifecycle::Starting
        })
    }

    /// Apply a successful startup under the epoch fence, then release the
    /// queue.
    pub(crate) fn complete_success(
        &self,
        entry: &Arc<ServiceEntry>,
        epoch: u64,
        fallback_override: Option<Url>,
        started: Instant,
    ) {
        let applied = entry.update_state(|state| {
            if state.startup_epoch != epoch || state.lifecycle != Lifecycle::Starting {
                return false;
            }
            state.lifecycle = Lifecycle::Hot;
            state.readiness = Readiness::Ready;
            state.startup_error = None;
            state.active_base_url = fallback_override.clone();
            state.touch();
            true
        });

        if !applied {
            tracing::debug!(service = %entry.id, epoch = epoch, "Discarding stale startup success");
            return;
        }

        let released = entry.queue.drain_all(ReleaseSignal::Proceed);
        let outcome = if fallback_override.is_some() {
            "fallback"
        } else {
            "success"
        };
        tracing::info!(
            service = %entry.id,
            epoch = epoch,
            released = released,
            outcome = outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Service is hot"
        );
        metrics::record_lifecycle(&entry.id, Lifecycle::Hot);
        metrics::record_startup(&entry.id, outcome, started.elapsed());
        self.log_activity(&entry.id, "ready", outcome);
    }

    /// Apply a terminal failure under the epoch fence, then drain the
    /// queue with the error.
    pub(crate) fn complete_failure(
        &self,
        entry: &Arc<ServiceEntry>,
        epoch: u64,
        reason: String,
        started: Instant,
    ) {
        let applied = entry.update_state(|state| {
            if state.startup_epoch != epoch || state.lifecycle != Lifecycle::Starting {
                return false;
            }
            state.lifecycle = Lifecycle::Cold;
            state.readiness = Readiness::NotReady;
            state.startup_error = Some(reason.clone());
            state.active_base_url = None;
            true
        });

        if !applied {
            tracing::debug!(service = %entry.id, epoch = epoch, "Discarding stale startup failure");
            return;
        }

        let drained = entry.queue.drain_all(ReleaseSignal::StartupFailed(reason.clone()));
        tracing::error!(
            service = %entry.id,
            epoch = epoch,
            drained = drained,
            error = %reason,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Startup failed terminally"
        );
        metrics::record_lifecycle(&entry.id, Lifecycle::Cold);
        metrics::record_startup(&entry.id, "failed", started.elapsed());
        self.log_activity(&entry.id, "startup_failed", &reason);
    }

    fn abort_cancelled(&self, entry: &Arc<ServiceEntry>, epoch: u64) {
        entry.update_state(|state| {
            if state.startup_epoch == epoch && state.lifecycle == Lifecycle::Starting {
                state.lifecycle = Lifecycle::Cold;
                state.readiness = Readiness::NotReady;
                state.active_base_url = None;
            }
        });
        tracing::info!(service = %entry.id, epoch = epoch, "Startup cancelled by shutdown");
    }

    /// Idle-shutdown path, shared by the idle monitor and the stop
    /// endpoint. Returns true when a HOT→COLD transition was performed.
    pub async fn stop_service(self: &Arc<Self>, entry: &Arc<ServiceEntry>) -> bool {
        let claimed = entry.update_state(|state| {
            if state.lifecycle != Lifecycle::Hot {
                return false;
            }
            state.lifecycle = Lifecycle::Stopping;
            state.readiness = Readiness::NotReady;
            true
        });
        if !claimed {
            return false;
        }

        tracing::info!(service = %entry.id, "Stopping service");
        metrics::record_lifecycle(&entry.id, Lifecycle::Stopping);

        let cfg = entry.config();
        if let Some(remote) = cfg.remote.as_ref().filter(|r| r.enabled) {
            if let Some(executor) = self.executor.as_ref() {
                // Best effort: a failed stop is logged but never blocks the
                // COLD transition.
                match executor
                    .stop(
                        &entry.id,
                        &remote.machine_id,
                        &remote.stop_template_id,
                        &HashMap::new(),
                    )
                    .await
                {
                    Ok(task) => {
                        if let Err(e) = await_task(
                            executor.as_ref(),
                            &task,
                            Duration::from_secs(remote.poll_interval_s),
                            Duration::from_secs(remote.task_timeout_s),
                        )
                        .await
                        {
                            tracing::warn!(service = %entry.id, error = %e, "Remote stop task failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(service = %entry.id, error = %e, "Remote stop submission failed")
                    }
                }
            }
        }

        entry.update_state(|state| {
            if state.lifecycle == Lifecycle::Stopping {
                state.lifecycle = Lifecycle::Cold;
                state.active_base_url = None;
            }
        });
        metrics::record_lifecycle(&entry.id, Lifecycle::Cold);
        metrics::record_idle_stop(&entry.id);
        self.log_activity(&entry.id, "stopped", "");

        // Requests that arrived during STOPPING were parked without a
        // trigger; give them their startup now.
        if entry.queue.pending() > 0 {
            self.trigger(entry);
        }
        true
    }

    fn log_activity(&self, service_id: &str, event: &str, detail: &str) {
        if let Some(store) = self.store.clone() {
            let service_id = service_id.to_string();
            let event = event.to_string();
            let detail = detail.to_string();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = store.log_activity(&service_id, &event, &detail) {
                    tracing::warn!(service = %service_id, error = %e, "Failed to record activity");
                }
            });
        }
    }
}

enum AttemptError {
    Failed(String),
    Cancelled,
}

/// Retry delay with up to 10% jitter so co-triggered services do not
/// reprobe in lockstep.
fn jittered(delay_ms: u64) -> Duration {
    use rand::Rng;

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter)
}
