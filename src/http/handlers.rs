//! Request handlers for the gateway surface.
//!
//! # Data Flow
//! ```text
//! /services/{id}/...  → parse id → registry lookup
//!     → ready? forward immediately
//!     → else enqueue, trigger startup, await the release signal:
//!         PROCEED         → resolve upstream, proxy
//!         STARTUP_FAILED  → 502 with the terminal error
//!         queue full      → 503
//!         entry timeout   → 504
//! /v1/requests        → same path, target described in the JSON body
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use http_body::Body as HttpBody;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::http::server::AppState;
use crate::observability::metrics;
use crate::proxy::{is_idempotent, observe_request, ProxyBody};
use crate::queue::{EnqueueOutcome, ReleaseSignal};
use crate::registry::state::{Lifecycle, Readiness};
use crate::registry::{is_ready, ServiceEntry};
use crate::routing::RequestContext;

/// Largest JSON body the router may buffer for a shallow parse.
const BODY_PEEK_LIMIT: u64 = 64 * 1024;

/// Largest body held in memory so an idempotent request can be replayed.
const RETRY_BUFFER_LIMIT: u64 = 1024 * 1024;

/// Response shape of the status/start/stop endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service_id: String,
    pub state: Lifecycle,
    pub readiness: Readiness,
    pub queue_pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Transparent proxy for `/services/{id}`.
pub async fn proxy_service_root(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    request: Request<Body>,
) -> Response<Body> {
    transparent_proxy(state, client_addr, id, "/".to_string(), request).await
}

/// Transparent proxy for `/services/{id}/{rest...}`.
pub async fn proxy_service_path(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Path((id, rest)): Path<(String, String)>,
    request: Request<Body>,
) -> Response<Body> {
    transparent_proxy(state, client_addr, id, format!("/{rest}"), request).await
}

async fn transparent_proxy(
    state: AppState,
    client_addr: SocketAddr,
    id: String,
    path: String,
    request: Request<Body>,
) -> Response<Body> {
    let started = Instant::now();

    if state.shutting_down.load(Ordering::Relaxed) {
        return shutting_down_response();
    }

    let Some(entry) = state.registry.get_or_synthesize(&id) else {
        tracing::warn!(service = %id, "Unknown service and no default template configured");
        return plain_response(StatusCode::NOT_FOUND, "Unknown service");
    };

    let query = request.uri().query().map(str::to_string);
    let request_id = request.headers().get("x-request-id").cloned();
    let (parts, body) = request.into_parts();
    let (body, body_peek) = prepare_body(&parts.method, &parts.headers, body).await;

    let ctx = RequestContext {
        method: parts.method.clone(),
        path,
        query,
        headers: parts.headers,
        body_peek,
    };

    let response = admit_and_forward(
        &state,
        &entry,
        &ctx,
        body,
        Some(client_addr.ip()),
        request_id,
    )
    .await;
    observe_request(&entry.id, &ctx.method, response.status(), started.elapsed());
    response
}

/// Body of `POST /v1/requests`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub service_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Generic dispatcher: executes the transparent-proxy path with the
/// target described in the request body.
pub async fn dispatch_request(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Json(dispatch): Json<DispatchRequest>,
) -> Response<Body> {
    let started = Instant::now();

    if state.shutting_down.load(Ordering::Relaxed) {
        return shutting_down_response();
    }

    let Ok(method) = dispatch.method.parse::<Method>() else {
        return plain_response(StatusCode::BAD_REQUEST, "Invalid method");
    };

    let Some(entry) = state.registry.get_or_synthesize(&dispatch.service_id) else {
        return plain_response(StatusCode::NOT_FOUND, "Unknown service");
    };

    let mut headers = HeaderMap::new();
    for (name, value) in dispatch.headers.unwrap_or_default() {
        let Ok(name) = name.parse::<HeaderName>() else {
            return plain_response(StatusCode::BAD_REQUEST, "Invalid header name");
        };
        let Ok(value) = HeaderValue::from_str(&value) else {
            return plain_response(StatusCode::BAD_REQUEST, "Invalid header value");
        };
        headers.insert(name, value);
    }

    let (path, query) = match dispatch.path.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (dispatch.path.clone(), None),
    };
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };

    let (body, body_peek) = match dispatch.body {
        None => (ProxyBody::Empty, None),
        Some(serde_json::Value::String(raw)) => {
            (ProxyBody::Buffered(Bytes::from(raw)), None)
        }
        Some(value) => {
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            let raw = value.to_string();
            (ProxyBody::Buffered(Bytes::from(raw)), Some(value))
        }
    };

    let ctx = RequestContext {
        method,
        path,
        query,
        headers,
        body_peek,
    };

    // Dispatched requests did not pass the request-id layer; mint one so
    // upstream logs still correlate.
    let request_id = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok();

    let response = admit_and_forward(
        &state,
        &entry,
        &ctx,
        body,
        Some(client_addr.ip()),
        request_id,
    )
    .await;
    observe_request(&entry.id, &ctx.method, response.status(), started.elapsed());
    response
}

/// Shared admission path: bypass the queue when hot, otherwise park until
/// a release signal or the per-entry deadline.
async fn admit_and_forward(
    state: &AppState,
    entry: &Arc<ServiceEntry>,
    ctx: &RequestContext,
    body: ProxyBody,
    client_ip: Option<std::net::IpAddr>,
    request_id: Option<HeaderValue>,
) -> Response<Body> {
    let cfg = entry.config();

    let ready = entry.update_state(|s| is_ready(s));
    if ready {
        return state
            .proxy
            .forward(entry, ctx, body, client_ip, request_id)
            .await;
    }

    let receiver = match entry.queue.enqueue() {
        EnqueueOutcome::Admitted(rx) => rx,
        EnqueueOutcome::RejectedFull => {
            metrics::record_queue(&entry.id, "rejected_full");
            tracing::warn!(service = %entry.id, "Queue saturated");
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Queue saturated");
        }
    };

    metrics::record_queue(&entry.id, "admitted");
    metrics::record_queue_depth(&entry.id, entry.queue.pending());

    // A second admitter that finds a startup in flight parks without
    // re-triggering.
    state.orchestrator.trigger(entry);

    // The readiness edge may have fired between the ready check and the
    // enqueue, in which case the drain already happened and nobody will
    // signal this entry. Recheck and self-release.
    if entry.update_state(|s| is_ready(s)) {
        entry.queue.drain_all(ReleaseSignal::Proceed);
    }

    let deadline = queue_wait_deadline(&cfg);
    let signal = match tokio::time::timeout(deadline, receiver).await {
        Err(_) => {
            metrics::record_queue(&entry.id, "timeout");
            tracing::warn!(service = %entry.id, timeout_s = cfg.request_timeout_seconds, "Entry deadline expired while parked");
            return plain_response(StatusCode::GATEWAY_TIMEOUT, "Timed out waiting for service");
        }
        Ok(Err(_)) => {
            return plain_response(StatusCode::BAD_GATEWAY, "Service queue closed");
        }
        Ok(Ok(signal)) => signal,
    };
    metrics::record_queue_depth(&entry.id, entry.queue.pending());

    match signal {
        ReleaseSignal::Proceed => {
            state
                .proxy
                .forward(entry, ctx, body, client_ip, request_id)
                .await
        }
        ReleaseSignal::StartupFailed(reason) => {
            plain_response_owned(StatusCode::BAD_GATEWAY, format!("Startup failed: {reason}"))
        }
        ReleaseSignal::Rejected => {
            plain_response(StatusCode::SERVICE_UNAVAILABLE, "Request evicted from queue")
        }
        ReleaseSignal::GatewayShutdown => shutting_down_response(),
    }
}

/// Per-entry deadline, derived from `request_timeout_seconds`: the parked
/// entry outlives the worst-case startup chain by one second, so it
/// observes the terminal signal instead of racing it.
///
/// Each remote-backed primary attempt blocks in the executor for up to
/// `task_timeout_s` before its readiness window even opens, so that
/// budget counts per attempt. The fallback attempt never re-invokes the
/// executor and only carries the readiness window.
fn queue_wait_deadline(cfg: &crate::config::ServiceConfig) -> Duration {
    let attempts = u64::from(cfg.retry_count.max(1));
    let fallback = u64::from(cfg.fallback_url.is_some());
    let retry_delays = cfg.retry_delay_ms.saturating_mul(attempts.saturating_sub(1));
    let remote_task_budget = cfg
        .remote
        .as_ref()
        .filter(|r| r.enabled)
        .map(|r| r.task_timeout_s)
        .unwrap_or(0);

    let startup_chain = cfg
        .request_timeout_seconds
        .saturating_add(remote_task_budget)
        .saturating_mul(attempts)
        .saturating_add(cfg.request_timeout_seconds.saturating_mul(fallback));

    Duration::from_secs(startup_chain.saturating_add(1)) + Duration::from_millis(retry_delays)
}

/// Decide how to carry the request body downstream.
///
/// Small JSON bodies are buffered for the model router's shallow parse;
/// small bodies on idempotent methods are buffered so a single retry can
/// replay them. Everything else streams untouched.
async fn prepare_body(
    method: &Method,
    headers: &HeaderMap,
    body: Body,
) -> (ProxyBody, Option<serde_json::Value>) {
    if HttpBody::size_hint(&body).exact() == Some(0) {
        return (ProxyBody::Empty, None);
    }

    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);

    let buffer_limit = match content_length {
        Some(len) if is_json && len <= BODY_PEEK_LIMIT => Some(len),
        Some(len) if is_idempotent(method) && len <= RETRY_BUFFER_LIMIT => Some(len),
        _ => None,
    };

    let Some(limit) = buffer_limit else {
        return (ProxyBody::Streaming(body), None);
    };

    match axum::body::to_bytes(body, limit as usize).await {
        Ok(bytes) => {
            let peek = if is_json {
                serde_json::from_slice(&bytes).ok()
            } else {
                None
            };
            (ProxyBody::Buffered(bytes), peek)
        }
        Err(e) => {
            // Content-Length lied; nothing left to forward.
            tracing::warn!(error = %e, "Failed to buffer request body");
            (ProxyBody::Empty, None)
        }
    }
}

/// `GET /v1/services/{id}/status`.
///
/// Opportunistically probes the health endpoint of a COLD service so
/// externally-started upstreams flip to HOT without a proxied request.
pub async fn service_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response<Body> {
    let Some(entry) = state.registry.get(&id) else {
        return plain_response(StatusCode::NOT_FOUND, "Unknown service");
    };

    let cfg = entry.config();
    let snapshot = entry.state_snapshot();

    if snapshot.lifecycle == Lifecycle::Cold {
        if let Some(health_url) = cfg.health_url.clone() {
            let live = state
                .probe_client
                .get(health_url)
                .timeout(Duration::from_millis(500))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if live {
                let flipped = entry.update_state(|s| {
                    if s.lifecycle == Lifecycle::Cold {
                        s.lifecycle = Lifecycle::Hot;
                        s.readiness = Readiness::Ready;
                        s.touch();
                        true
                    } else {
                        false
                    }
                });
                if flipped {
                    tracing::info!(service = %entry.id, "Status probe found a live upstream, marking hot");
                    metrics::record_lifecycle(&entry.id, Lifecycle::Hot);
                }
            }
        }
    }

    Json(status_of(&entry)).into_response()
}

/// `POST /v1/services/{id}/start` — proactive warmup.
pub async fn start_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response<Body> {
    let Some(entry) = state.registry.get(&id) else {
        return plain_response(StatusCode::NOT_FOUND, "Unknown service");
    };

    let triggered = state.orchestrator.trigger(&entry);
    tracing::info!(service = %id, triggered = triggered, "Warmup requested");
    Json(status_of(&entry)).into_response()
}

/// `POST /v1/services/{id}/stop` — request the idle-shutdown path.
pub async fn stop_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response<Body> {
    let Some(entry) = state.registry.get(&id) else {
        return plain_response(StatusCode::NOT_FOUND, "Unknown service");
    };

    let stopped = state.orchestrator.stop_service(&entry).await;
    tracing::info!(service = %id, stopped = stopped, "Stop requested");
    Json(status_of(&entry)).into_response()
}

fn status_of(entry: &Arc<ServiceEntry>) -> ServiceStatus {
    let cfg = entry.config();
    let state = entry.state_snapshot();
    ServiceStatus {
        service_id: entry.id.clone(),
        state: state.lifecycle,
        readiness: state.readiness,
        queue_pending: entry.queue.pending(),
        machine_id: cfg
            .remote
            .as_ref()
            .filter(|r| r.enabled)
            .map(|r| r.machine_id.clone()),
        last_error: state.startup_error,
    }
}

/// `GET /v1/strategies` — loaded strategies and per-service routing setup.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyListing {
    pub strategies: Vec<String>,
    pub services: HashMap<String, ServiceStrategyView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStrategyView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    pub instances: usize,
    pub model_mappings: usize,
}

pub async fn list_strategies(State(state): State<AppState>) -> Json<StrategyListing> {
    let mut services = HashMap::new();
    for entry in state.registry.list() {
        let cfg = entry.config();
        services.insert(
            entry.id.clone(),
            ServiceStrategyView {
                strategy: cfg.strategy.clone(),
                instances: cfg.instances.len(),
                model_mappings: cfg.routing.by_model.len(),
            },
        );
    }

    Json(StrategyListing {
        strategies: state
            .strategies
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
        services,
    })
}

/// `GET /v1/metrics` — Prometheus exposition.
pub async fn render_metrics(State(state): State<AppState>) -> Response<Body> {
    match &state.metrics_handle {
        Some(handle) => {
            let body = handle.render();
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Body::from(body))
                .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "render failed"))
        }
        None => plain_response(StatusCode::NOT_FOUND, "Metrics disabled"),
    }
}

/// Routes that exist in the surface but are not implemented yet.
pub async fn unimplemented_route() -> Response<Body> {
    plain_response(StatusCode::NOT_IMPLEMENTED, "Not implemented")
}

fn shutting_down_response() -> Response<Body> {
    let mut response = plain_response(StatusCode::SERVICE_UNAVAILABLE, "Gateway shutting down");
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn plain_response_owned(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn service(yaml: &str) -> ServiceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn queue_deadline_covers_retries_and_fallback() {
        let cfg = service(
            r#"
base_url: "http://127.0.0.1:9000"
fallback_url: "http://127.0.0.1:9001"
retry_count: 2
retry_delay_ms: 500
request_timeout_seconds: 3
"#,
        );
        // 2 primary attempts * 3s + fallback 3s + 1s margin + 1 retry delay.
        assert_eq!(
            queue_wait_deadline(&cfg),
            Duration::from_secs(10) + Duration::from_millis(500)
        );
    }

    #[test]
    fn queue_deadline_includes_remote_task_budget_per_attempt() {
        let cfg = service(
            r#"
base_url: "http://127.0.0.1:9000"
retry_count: 2
retry_delay_ms: 0
request_timeout_seconds: 3
remote:
  enabled: true
  machine_id: "gpu-01"
  start_template_id: "12"
  stop_template_id: "13"
  task_timeout_s: 60
  poll_interval_s: 1
"#,
        );
        // 2 attempts * (60s task + 3s readiness) + 1s margin.
        assert_eq!(queue_wait_deadline(&cfg), Duration::from_secs(127));
    }

    #[test]
    fn disabled_remote_block_adds_no_budget() {
        let cfg = service(
            r#"
base_url: "http://127.0.0.1:9000"
retry_count: 1
request_timeout_seconds: 3
remote:
  enabled: false
  machine_id: "gpu-01"
  start_template_id: "12"
  stop_template_id: "13"
  task_timeout_s: 60
  poll_interval_s: 1
"#,
        );
        assert_eq!(queue_wait_deadline(&cfg), Duration::from_secs(4));
    }

    #[test]
    fn remote_fallback_attempt_carries_no_task_budget() {
        let cfg = service(
            r#"
base_url: "http://127.0.0.1:9000"
fallback_url: "http://127.0.0.1:9001"
retry_count: 1
request_timeout_seconds: 3
remote:
  enabled: true
  machine_id: "gpu-01"
  start_template_id: "12"
  stop_template_id: "13"
  task_timeout_s: 60
  poll_interval_s: 1
"#,
        );
        // 1 attempt * (60s + 3s) + fallback 3s + 1s margin.
        assert_eq!(queue_wait_deadline(&cfg), Duration::from_secs(67));
    }
}
