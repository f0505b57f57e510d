//! Configuration loading from disk and the environment.
//!
//! Load order: YAML file → per-service environment overrides → semantic
//! validation. Override variables are named `<UPPER_SERVICE_ID>_<FIELD>`
//! with hyphens in the service id mapped to underscores, e.g.
//! `SVC_A_QUEUE_SIZE=4` for service `svc-a`.

use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::config::schema::{GatewayConfig, ServiceConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid YAML for the schema.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An environment override carried an unusable value.
    #[error("Invalid override {var}: {reason}")]
    Override { var: String, reason: String },

    /// Semantic validation failed.
    #[error("Validation failed: {}", format_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, override, and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: GatewayConfig = serde_yaml::from_str(&content)?;

    apply_env_overrides(&mut config, std::env::vars())?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Environment variable prefix for a service id: uppercase, hyphens mapped
/// to underscores.
fn env_prefix(service_id: &str) -> String {
    service_id.to_uppercase().replace('-', "_")
}

/// Apply `<UPPER_SERVICE_ID>_<FIELD>` overrides to the parsed config.
///
/// Takes the variable iterator as an argument so tests can inject values
/// without touching the process environment.
pub fn apply_env_overrides<I>(config: &mut GatewayConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let vars: Vec<(String, String)> = vars.into_iter().collect();

    for (id, svc) in config.services.iter_mut() {
        let prefix = env_prefix(id);
        for (key, value) in &vars {
            let Some(field) = key.strip_prefix(&prefix).and_then(|k| k.strip_prefix('_')) else {
                continue;
            };
            apply_field(svc, field, value).map_err(|reason| ConfigError::Override {
                var: key.clone(),
                reason,
            })?;
            tracing::debug!(service = %id, var = %key, "Applied environment override");
        }
    }
    Ok(())
}

fn apply_field(svc: &mut ServiceConfig, field: &str, value: &str) -> Result<(), String> {
    match field {
        "BASE_URL" => svc.base_url = value.parse().map_err(|e| format!("{e}"))?,
        "FALLBACK_URL" => svc.fallback_url = Some(value.parse().map_err(|e| format!("{e}"))?),
        "HEALTH_URL" => svc.health_url = Some(value.parse().map_err(|e| format!("{e}"))?),
        "WARMUP_MS" => svc.warmup_ms = parse_num(value)?,
        "IDLE_TIMEOUT_MS" => svc.idle_timeout_ms = parse_num(value)?,
        "RETRY_COUNT" => svc.retry_count = parse_num(value)?,
        "RETRY_DELAY_MS" => svc.retry_delay_ms = parse_num(value)?,
        "QUEUE_SIZE" => svc.queue_size = parse_num(value)?,
        "REQUEST_TIMEOUT_SECONDS" => svc.request_timeout_seconds = parse_num(value)?,
        "STRATEGY" => {
            svc.strategy = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        }
        // Unrecognized suffixes are ignored: service ids are free-form and
        // unrelated variables can share the prefix.
        _ => {}
    }
    Ok(())
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| format!("expected a number, got '{value}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_yaml() -> &'static str {
        r#"
listener:
  bind_address: "127.0.0.1:0"
services:
  svc-a:
    base_url: "http://127.0.0.1:9000"
    queue_size: 8
"#
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(base_yaml().as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.services["svc-a"].queue_size, 8);
    }

    #[test]
    fn invalid_yaml_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"services: [not, a, map]").unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_override_replaces_fields() {
        let mut config: GatewayConfig = serde_yaml::from_str(base_yaml()).unwrap();
        let vars = vec![
            ("SVC_A_QUEUE_SIZE".to_string(), "3".to_string()),
            ("SVC_A_BASE_URL".to_string(), "http://10.0.0.5:9000".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];

        apply_env_overrides(&mut config, vars).unwrap();

        let svc = &config.services["svc-a"];
        assert_eq!(svc.queue_size, 3);
        assert_eq!(svc.base_url.as_str(), "http://10.0.0.5:9000/");
    }

    #[test]
    fn bad_override_value_is_rejected() {
        let mut config: GatewayConfig = serde_yaml::from_str(base_yaml()).unwrap();
        let vars = vec![("SVC_A_QUEUE_SIZE".to_string(), "lots".to_string())];

        let err = apply_env_overrides(&mut config, vars).unwrap_err();
        assert!(matches!(err, ConfigError::Override { .. }));
    }
}
