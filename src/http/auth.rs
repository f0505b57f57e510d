//! Bearer-key authentication for the management surface.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::http::server::AppState;

/// Middleware guarding `/v1/*`. Disabled auth passes everything through;
/// the transparent proxy path is never routed here.
pub async fn management_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let config = state.config.load_full();
    if !config.auth.enabled {
        return Ok(next.run(request).await);
    }

    let presented = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(key) = presented else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    if config.auth.api_keys.iter().any(|k| k == key) {
        return Ok(next.run(request).await);
    }

    // Keys provisioned at runtime live in the metadata store.
    if let Some(store) = &state.store {
        if store.key_exists(key).unwrap_or(false) {
            return Ok(next.run(request).await);
        }
    }

    Err(StatusCode::UNAUTHORIZED)
}
