//! On-demand HTTP gateway library.
//!
//! Proxies client requests to managed backend services, starting them on
//! first use, parking requests during cold starts, and shutting them down
//! again after a period of inactivity.

pub mod config;
pub mod http;
pub mod idle;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod routing;
pub mod startup;
pub mod store;

pub use config::GatewayConfig;
pub use http::GatewayServer;
pub use lifecycle::Shutdown;
