//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from the YAML config
//! file; per-service fields can additionally be overridden from the
//! environment (see `loader`).

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Service id used as a template for unknown ids on the transparent
    /// proxy path. Unset means unknown ids are rejected.
    pub default_service: Option<String>,

    /// Per-service definitions, keyed by service id.
    pub services: HashMap<String, ServiceConfig>,

    /// Remote executor (automation service) settings shared by all services.
    pub executor: ExecutorConfig,

    /// Idle monitor settings.
    pub idle: IdleConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// API-key authentication for the management surface.
    pub auth: AuthConfig,

    /// Embedded metadata store settings.
    pub store: StoreConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Configuration of a single managed service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    /// Primary upstream base URL.
    pub base_url: Url,

    /// Upstream tried once after all primary startup attempts fail.
    #[serde(default)]
    pub fallback_url: Option<Url>,

    /// Health endpoint polled during startup. When absent, readiness falls
    /// back to the `warmup_ms` timer.
    #[serde(default)]
    pub health_url: Option<Url>,

    /// Warm-up period in milliseconds when no health URL is configured.
    #[serde(default)]
    pub warmup_ms: u64,

    /// Interval between health polls during startup.
    #[serde(default = "default_health_poll_interval_ms")]
    pub health_poll_interval_ms: u64,

    /// Inactivity period after which a hot service is shut down.
    /// 0 disables auto-shutdown.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    /// Primary startup attempts before the fallback is considered.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Delay between primary startup attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Maximum number of requests parked while the service starts.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Per-request deadline, also the overall readiness deadline of a
    /// single startup attempt.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Named routing strategy. Unset means requests go to `base_url`.
    #[serde(default)]
    pub strategy: Option<String>,

    /// Upstream instances available to routing strategies.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Strategy-specific routing table.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Remote start/stop via the automation service.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

fn default_health_poll_interval_ms() -> u64 {
    250
}

fn default_retry_count() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_queue_size() -> usize {
    16
}

fn default_request_timeout_seconds() -> u64 {
    60
}

/// A single upstream instance of a service.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InstanceConfig {
    /// Instance base URL.
    pub url: Url,

    /// Weight for load balancing (currently informational).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Deployment region label.
    #[serde(default)]
    pub region: Option<String>,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

/// Strategy-specific routing tables.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    /// JSON body key inspected by the model router.
    pub model_key: String,

    /// Direct mapping from a model name to an instance URL.
    pub by_model: HashMap<String, Url>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            model_key: "model".to_string(),
            by_model: HashMap::new(),
        }
    }
}

/// Per-service remote start/stop settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Whether startup/shutdown go through the remote executor.
    pub enabled: bool,

    /// Target machine identifier passed to the automation service.
    pub machine_id: String,

    /// Automation template used to start the service.
    pub start_template_id: String,

    /// Automation template used to stop the service.
    pub stop_template_id: String,

    /// Maximum time to wait for an automation task to finish.
    pub task_timeout_s: u64,

    /// Interval between task status polls.
    pub poll_interval_s: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            machine_id: String::new(),
            start_template_id: String::new(),
            stop_template_id: String::new(),
            task_timeout_s: 300,
            poll_interval_s: 2,
        }
    }
}

/// Remote executor endpoint shared by all services.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Base URL of the automation service. Unset disables remote execution
    /// even for services with a `remote` block.
    pub base_url: Option<Url>,

    /// Project scope used in the automation API paths.
    pub project_id: String,

    /// HTTP timeout for automation API calls.
    pub http_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            project_id: "1".to_string(),
            http_timeout_secs: 10,
        }
    }
}

/// Idle monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IdleConfig {
    /// Sweep cadence of the idle monitor.
    pub sweep_interval_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus recorder and the /v1/metrics route.
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// API-key authentication for the management surface (`/v1/*`).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable bearer-key checks. The transparent proxy path is never gated.
    pub enabled: bool,

    /// Accepted keys.
    pub api_keys: Vec<String>,
}

/// Embedded metadata store settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Enable the SQLite store.
    pub enabled: bool,

    /// Database file path.
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "hestia.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_service_yaml_fills_defaults() {
        let yaml = r#"
base_url: "http://127.0.0.1:9000"
"#;
        let cfg: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.base_url.as_str(), "http://127.0.0.1:9000/");
        assert_eq!(cfg.warmup_ms, 0);
        assert_eq!(cfg.idle_timeout_ms, 0);
        assert_eq!(cfg.retry_count, 1);
        assert_eq!(cfg.queue_size, 16);
        assert_eq!(cfg.request_timeout_seconds, 60);
        assert_eq!(cfg.health_poll_interval_ms, 250);
        assert!(cfg.fallback_url.is_none());
        assert!(cfg.strategy.is_none());
        assert!(cfg.instances.is_empty());
    }

    #[test]
    fn routing_table_parses() {
        let yaml = r#"
base_url: "http://127.0.0.1:9000"
strategy: "model_router"
instances:
  - url: "http://10.0.0.1:9000"
    weight: 2
    region: "eu"
  - url: "http://10.0.0.2:9000"
routing:
  model_key: "model"
  by_model:
    m1: "http://10.0.0.1:9000"
"#;
        let cfg: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.instances.len(), 2);
        assert_eq!(cfg.instances[0].weight, 2);
        assert_eq!(cfg.instances[1].weight, 1);
        assert_eq!(
            cfg.routing.by_model.get("m1").unwrap().as_str(),
            "http://10.0.0.1:9000/"
        );
    }

    #[test]
    fn remote_block_defaults() {
        let yaml = r#"
base_url: "http://127.0.0.1:9000"
remote:
  enabled: true
  machine_id: "gpu-01"
  start_template_id: "12"
  stop_template_id: "13"
"#;
        let cfg: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        let remote = cfg.remote.unwrap();
        assert!(remote.enabled);
        assert_eq!(remote.task_timeout_s, 300);
        assert_eq!(remote.poll_interval_s, 2);
    }
}
