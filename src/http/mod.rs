//! HTTP surface of the gateway.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum router, request-id, trace layers)
//!     → handlers.rs
//!         /services/{id}/...   transparent proxy (queue + startup + proxy)
//!         /v1/...              management surface (auth.rs gates it)
//! ```

pub mod auth;
pub mod handlers;
pub mod server;

pub use server::GatewayServer;
