//! Reverse proxy forwarding.
//!
//! # Forwarding Contract
//! - Method preserved exactly; Host rewritten to the upstream authority
//! - Hop-by-hop headers stripped in both directions
//! - Request and response bodies stream without full buffering
//! - Per-request timeout bounds time-to-response-head
//! - Outcomes feed the strategy health tracker; idempotent methods get at
//!   most one retry against the next instance
//! - Activity is recorded at admission and when the response body
//!   finishes streaming

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::uri::{Authority, Scheme};
use bytes::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::observability::metrics;
use crate::registry::ServiceEntry;
use crate::routing::{RequestContext, StrategyRegistry};

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Request body as the handler prepared it.
pub enum ProxyBody {
    /// Small body held in memory; replayable for a retry.
    Buffered(Bytes),
    /// Streaming body; forwarded once, never retried.
    Streaming(Body),
    Empty,
}

impl ProxyBody {
    fn replayable(&self) -> bool {
        !matches!(self, ProxyBody::Streaming(_))
    }

    fn take_body(&mut self) -> Body {
        match std::mem::replace(self, ProxyBody::Empty) {
            ProxyBody::Buffered(bytes) => {
                let body = Body::from(bytes.clone());
                *self = ProxyBody::Buffered(bytes);
                body
            }
            ProxyBody::Streaming(body) => body,
            ProxyBody::Empty => Body::empty(),
        }
    }
}

/// Methods safe to replay against another instance.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Remove hop-by-hop headers and the Host header (rewritten per upstream).
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    headers.remove(header::HOST);
}

/// Build the upstream URI: scheme and authority from the resolved
/// upstream, path and query from the client request. A path prefix on the
/// upstream URL is preserved.
pub fn compose_upstream_uri(upstream: &Url, path: &str, query: Option<&str>) -> Option<Uri> {
    let scheme = Scheme::try_from(upstream.scheme()).ok()?;
    let authority = Authority::try_from(upstream.authority()).ok()?;

    let prefix = upstream.path().trim_end_matches('/');
    let mut path_and_query = format!("{prefix}{path}");
    if path_and_query.is_empty() {
        path_and_query.push('/');
    }
    if let Some(q) = query {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .ok()
}

/// Streams admitted requests to resolved upstreams.
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
    strategies: Arc<StrategyRegistry>,
}

impl ReverseProxy {
    pub fn new(strategies: Arc<StrategyRegistry>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client, strategies }
    }

    /// Forward an admitted request. `ctx` carries the routing facts; the
    /// body was prepared (peeked/buffered) by the handler.
    pub async fn forward(
        &self,
        entry: &Arc<ServiceEntry>,
        ctx: &RequestContext,
        mut body: ProxyBody,
        client_ip: Option<IpAddr>,
        request_id: Option<HeaderValue>,
    ) -> Response<Body> {
        entry.touch();

        let cfg = entry.config();
        let base_url = entry.effective_base_url();
        let timeout = Duration::from_secs(cfg.request_timeout_seconds);

        let mut resolution = self.strategies.resolve(&entry.id, ctx, &cfg, &base_url);
        let retry_allowed =
            cfg.retry_count > 0 && is_idempotent(&ctx.method) && body.replayable();
        let max_attempts = if retry_allowed { 2 } else { 1 };

        let mut attempt = 0;
        loop {
            attempt += 1;

            let Some(uri) =
                compose_upstream_uri(&resolution.url, &ctx.path, ctx.query.as_deref())
            else {
                tracing::error!(service = %entry.id, upstream = %resolution.url, "Upstream URL cannot form a URI");
                return error_response(StatusCode::BAD_GATEWAY, "Invalid upstream URL");
            };

            let request = match self.build_request(ctx, &uri, body.take_body(), client_ip, &request_id)
            {
                Ok(request) => request,
                Err(response) => return response,
            };

            tracing::debug!(
                service = %entry.id,
                upstream = %resolution.url,
                reason = ?resolution.reason,
                attempt = attempt,
                "Forwarding request"
            );

            match tokio::time::timeout(timeout, self.client.request(request)).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_server_error() {
                        self.strategies.health().report_failure(&resolution.url);
                        if attempt < max_attempts {
                            resolution =
                                self.strategies.resolve(&entry.id, ctx, &cfg, &base_url);
                            tracing::info!(
                                service = %entry.id,
                                status = %status,
                                next_upstream = %resolution.url,
                                "Upstream returned server error, retrying once"
                            );
                            continue;
                        }
                    } else if status.is_success() || status.is_redirection() {
                        self.strategies.health().report_success(&resolution.url);
                    }
                    return relay_response(entry, response);
                }
                Ok(Err(e)) => {
                    self.strategies.health().report_failure(&resolution.url);
                    if attempt < max_attempts {
                        resolution = self.strategies.resolve(&entry.id, ctx, &cfg, &base_url);
                        tracing::info!(
                            service = %entry.id,
                            error = %e,
                            next_upstream = %resolution.url,
                            "Transport error, retrying once"
                        );
                        continue;
                    }
                    tracing::error!(service = %entry.id, upstream = %resolution.url, error = %e, "Upstream request failed");
                    return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
                }
                Err(_) => {
                    self.strategies.health().report_failure(&resolution.url);
                    tracing::error!(
                        service = %entry.id,
                        upstream = %resolution.url,
                        timeout_s = cfg.request_timeout_seconds,
                        "Upstream response head timed out"
                    );
                    return error_response(StatusCode::GATEWAY_TIMEOUT, "Upstream timed out");
                }
            }
        }
    }

    fn build_request(
        &self,
        ctx: &RequestContext,
        uri: &Uri,
        body: Body,
        client_ip: Option<IpAddr>,
        request_id: &Option<HeaderValue>,
    ) -> Result<Request<Body>, Response<Body>> {
        let mut builder = Request::builder().method(ctx.method.clone()).uri(uri.clone());

        if let Some(headers) = builder.headers_mut() {
            *headers = ctx.headers.clone();
            let original_host = headers.get(header::HOST).cloned();
            strip_hop_headers(headers);

            if let Some(host) = original_host {
                headers.insert("x-forwarded-host", host);
            }
            headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
            if let Some(ip) = client_ip {
                let forwarded = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
                {
                    Some(existing) => format!("{existing}, {ip}"),
                    None => ip.to_string(),
                };
                if let Ok(value) = HeaderValue::from_str(&forwarded) {
                    headers.insert("x-forwarded-for", value);
                }
            }
            if let Some(id) = request_id {
                headers.insert("x-request-id", id.clone());
            }
        }

        builder.body(body).map_err(|e| {
            tracing::error!(error = %e, "Failed to build upstream request");
            error_response(StatusCode::BAD_GATEWAY, "Failed to build upstream request")
        })
    }
}

/// Relay the upstream response: copy status and non-hop headers, stream
/// the body, and record activity when the stream completes.
fn relay_response(entry: &Arc<ServiceEntry>, response: Response<hyper::body::Incoming>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    strip_hop_headers(&mut parts.headers);

    let tail_entry = entry.clone();
    let tail = futures_util::stream::poll_fn(move |_| {
        tail_entry.touch();
        std::task::Poll::Ready(None::<Result<Bytes, hyper::Error>>)
    });
    let stream = body.into_data_stream().chain(tail);

    Response::from_parts(parts, Body::from_stream(stream))
}

fn error_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

/// Record a finished request in the metrics pipeline.
pub fn observe_request(service: &str, method: &Method, status: StatusCode, elapsed: Duration) {
    metrics::record_request(service, method.as_str(), status.as_u16(), elapsed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert(header::HOST, HeaderValue::from_static("gateway.local"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_hop_headers(&mut headers);

        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::ACCEPT));
        assert!(headers.contains_key("x-custom"));
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let upstream: Url = "http://10.0.0.1:9000".parse().unwrap();
        let uri = compose_upstream_uri(&upstream, "/v1/chat", Some("stream=true")).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/v1/chat?stream=true");
    }

    #[test]
    fn upstream_uri_preserves_base_prefix() {
        let upstream: Url = "http://10.0.0.1:9000/api/".parse().unwrap();
        let uri = compose_upstream_uri(&upstream, "/predict", None).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/api/predict");
    }

    #[test]
    fn buffered_body_is_replayable() {
        let mut body = ProxyBody::Buffered(Bytes::from_static(b"{}"));
        assert!(body.replayable());
        let _ = body.take_body();
        // Still buffered for a second attempt.
        assert!(body.replayable());
        assert!(matches!(body, ProxyBody::Buffered(_)));
    }

    #[test]
    fn streaming_body_is_single_shot() {
        let body = ProxyBody::Streaming(Body::empty());
        assert!(!body.replayable());
    }
}
