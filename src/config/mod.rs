//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (YAML)
//!     → loader.rs (parse, env overrides)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On reload:
//!     watcher.rs forwards change events, debounces the burst
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → unchanged configs are dropped, the rest reach the registry
//!       (queues shrink if needed)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields except base_url have defaults to allow minimal configs
//! - A reload that fails validation keeps the running configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::ConfigError;
pub use schema::GatewayConfig;
pub use schema::InstanceConfig;
pub use schema::RemoteConfig;
pub use schema::ServiceConfig;
