//! Observability subsystem.
//!
//! # Design Decisions
//! - Uses tracing for structured logging, initialized in main
//! - Metrics go through the metrics facade; the Prometheus recorder is
//!   installed once and rendered on demand by the /v1/metrics route

pub mod metrics;
