//! Metrics collection and exposition.

use std::time::Duration;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::registry::state::Lifecycle;

/// Install the Prometheus recorder. The rendered text is served from the
/// gateway's own /v1/metrics route.
pub fn init_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

/// Record a completed gateway request.
pub fn record_request(service: &str, method: &str, status: u16, duration: Duration) {
    let labels = [
        ("service", service.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];

    counter!("gateway_requests_total", &labels).increment(1);
    histogram!("gateway_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Record a queue admission outcome.
pub fn record_queue(service: &str, outcome: &'static str) {
    counter!("gateway_queue_outcomes_total", "service" => service.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Update the parked-entry gauge for a service.
pub fn record_queue_depth(service: &str, depth: usize) {
    gauge!("gateway_queue_depth", "service" => service.to_string()).set(depth as f64);
}

/// Record a finished startup attempt chain.
pub fn record_startup(service: &str, outcome: &'static str, duration: Duration) {
    counter!("gateway_startups_total", "service" => service.to_string(), "outcome" => outcome)
        .increment(1);
    histogram!("gateway_startup_duration_seconds", "service" => service.to_string())
        .record(duration.as_secs_f64());
}

/// Update the lifecycle gauge (0 cold, 1 starting, 2 hot, 3 stopping).
pub fn record_lifecycle(service: &str, lifecycle: Lifecycle) {
    let value = match lifecycle {
        Lifecycle::Cold => 0.0,
        Lifecycle::Starting => 1.0,
        Lifecycle::Hot => 2.0,
        Lifecycle::Stopping => 3.0,
    };
    gauge!("gateway_service_state", "service" => service.to_string()).set(value);
}

/// Count an idle-driven shutdown.
pub fn record_idle_stop(service: &str) {
    counter!("gateway_idle_stops_total", "service" => service.to_string()).increment(1);
}
