//! Readiness probing.
//!
//! # Responsibilities
//! - Decide when a starting service is ready to take traffic
//! - Poll the health endpoint when one is configured, otherwise wait out
//!   the warm-up timer
//! - Return immediately on cancellation
//!
//! The prober is stateless across calls; the caller supplies the deadline
//! and the cancellation signal.

use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use url::Url;

/// Timeout applied to each individual health request.
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The deadline passed without a successful health response.
    #[error("Not ready before deadline: {0}")]
    Unready(String),

    /// Cancellation was signalled.
    #[error("Probe cancelled")]
    Cancelled,
}

/// What readiness policy to apply.
pub enum ReadinessPolicy<'a> {
    /// Poll this health URL every `poll_interval` until 2xx or deadline.
    HealthPoll {
        health_url: &'a Url,
        poll_interval: Duration,
    },
    /// Wait exactly this long, then declare ready.
    Warmup(Duration),
}

/// Wait until the target is ready under the given policy.
pub async fn await_ready(
    client: &reqwest::Client,
    policy: ReadinessPolicy<'_>,
    deadline: Instant,
    cancel: &mut broadcast::Receiver<()>,
) -> Result<(), ProbeError> {
    match policy {
        ReadinessPolicy::Warmup(warmup) => {
            tokio::select! {
                _ = tokio::time::sleep(warmup) => Ok(()),
                _ = cancel.recv() => Err(ProbeError::Cancelled),
            }
        }
        ReadinessPolicy::HealthPoll {
            health_url,
            poll_interval,
        } => {
            let mut last_error = String::from("no probe issued");
            loop {
                let probe = probe_once(client, health_url);
                let outcome = tokio::select! {
                    outcome = probe => outcome,
                    _ = cancel.recv() => return Err(ProbeError::Cancelled),
                };

                match outcome {
                    Ok(()) => return Ok(()),
                    Err(reason) => {
                        tracing::debug!(health_url = %health_url, reason = %reason, "Health probe failed");
                        last_error = reason;
                    }
                }

                if Instant::now() + poll_interval > deadline {
                    return Err(ProbeError::Unready(last_error));
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = cancel.recv() => return Err(ProbeError::Cancelled),
                }
            }
        }
    }
}

/// One health request; any 2xx counts as ready.
async fn probe_once(client: &reqwest::Client, health_url: &Url) -> Result<(), String> {
    let response = client
        .get(health_url.clone())
        .timeout(PROBE_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(format!("health endpoint returned {status}"))
    }
}

/// Rebase a health URL onto another upstream's authority. Used when the
/// fallback URL must be probed with the primary's health path.
pub fn rebase_health_url(health_url: &Url, target: &Url) -> Url {
    let mut rebased = health_url.clone();
    let _ = rebased.set_scheme(target.scheme());
    let _ = rebased.set_host(target.host_str());
    let _ = rebased.set_port(target.port());
    rebased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Shutdown;

    #[tokio::test(start_paused = true)]
    async fn warmup_zero_is_immediately_ready() {
        let client = reqwest::Client::new();
        let shutdown = Shutdown::new();
        let mut cancel = shutdown.subscribe();

        let result = await_ready(
            &client,
            ReadinessPolicy::Warmup(Duration::from_millis(0)),
            Instant::now() + Duration::from_secs(1),
            &mut cancel,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn warmup_waits_full_duration() {
        let client = reqwest::Client::new();
        let shutdown = Shutdown::new();
        let mut cancel = shutdown.subscribe();

        let started = Instant::now();
        await_ready(
            &client,
            ReadinessPolicy::Warmup(Duration::from_millis(500)),
            started + Duration::from_secs(5),
            &mut cancel,
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_interrupts_warmup() {
        let client = reqwest::Client::new();
        let shutdown = Shutdown::new();
        let mut cancel = shutdown.subscribe();

        let wait = await_ready(
            &client,
            ReadinessPolicy::Warmup(Duration::from_secs(30)),
            Instant::now() + Duration::from_secs(60),
            &mut cancel,
        );
        shutdown.trigger();

        let result = wait.await;
        assert!(matches!(result, Err(ProbeError::Cancelled)));
    }

    #[tokio::test]
    async fn unreachable_health_url_times_out() {
        let client = reqwest::Client::new();
        let shutdown = Shutdown::new();
        let mut cancel = shutdown.subscribe();
        let health_url: Url = "http://127.0.0.1:9/healthz".parse().unwrap();

        let result = await_ready(
            &client,
            ReadinessPolicy::HealthPoll {
                health_url: &health_url,
                poll_interval: Duration::from_millis(50),
            },
            Instant::now() + Duration::from_millis(200),
            &mut cancel,
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Unready(_))));
    }

    #[test]
    fn rebase_swaps_authority_keeps_path() {
        let health: Url = "http://primary:9000/healthz?deep=1".parse().unwrap();
        let fallback: Url = "https://fallback:9443".parse().unwrap();

        let rebased = rebase_health_url(&health, &fallback);
        assert_eq!(rebased.as_str(), "https://fallback:9443/healthz?deep=1");
    }
}
