//! Configuration validation logic.

use crate::config::schema::GatewayConfig;
use crate::routing::BUILTIN_STRATEGIES;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a GatewayConfig for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(ref default_id) = config.default_service {
        if !config.services.contains_key(default_id) {
            errors.push(ValidationError(format!(
                "default_service '{}' is not a configured service",
                default_id
            )));
        }
    }

    for (id, svc) in &config.services {
        if svc.queue_size == 0 {
            errors.push(ValidationError(format!(
                "service '{}': queue_size must be >= 1",
                id
            )));
        }
        if svc.request_timeout_seconds == 0 {
            errors.push(ValidationError(format!(
                "service '{}': request_timeout_seconds must be >= 1",
                id
            )));
        }
        if svc.health_poll_interval_ms == 0 {
            errors.push(ValidationError(format!(
                "service '{}': health_poll_interval_ms must be >= 1",
                id
            )));
        }

        if let Some(ref name) = svc.strategy {
            if !BUILTIN_STRATEGIES.contains(&name.as_str()) {
                errors.push(ValidationError(format!(
                    "service '{}': unknown strategy '{}'",
                    id, name
                )));
            }
        }

        // Model mappings must point at a configured instance.
        for (model, target) in &svc.routing.by_model {
            if !svc.instances.iter().any(|i| i.url == *target) {
                errors.push(ValidationError(format!(
                    "service '{}': by_model['{}'] -> {} is not a configured instance",
                    id, model, target
                )));
            }
        }

        if let Some(ref remote) = svc.remote {
            if remote.enabled {
                if config.executor.base_url.is_none() {
                    errors.push(ValidationError(format!(
                        "service '{}': remote.enabled requires executor.base_url",
                        id
                    )));
                }
                if remote.machine_id.is_empty() {
                    errors.push(ValidationError(format!(
                        "service '{}': remote.machine_id must be set",
                        id
                    )));
                }
                if remote.start_template_id.is_empty() {
                    errors.push(ValidationError(format!(
                        "service '{}': remote.start_template_id must be set",
                        id
                    )));
                }
                if remote.poll_interval_s == 0 {
                    errors.push(ValidationError(format!(
                        "service '{}': remote.poll_interval_s must be >= 1",
                        id
                    )));
                }
            }
        }
    }

    if config.auth.enabled && config.auth.api_keys.is_empty() {
        errors.push(ValidationError(
            "auth.enabled requires at least one entry in auth.api_keys".to_string(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::*;

    fn service(base: &str) -> ServiceConfig {
        serde_yaml::from_str(&format!("base_url: \"{}\"", base)).unwrap()
    }

    #[test]
    fn valid_config() {
        let mut config = GatewayConfig::default();
        config
            .services
            .insert("svc-a".into(), service("http://127.0.0.1:9000"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn zero_queue_size_rejected() {
        let mut config = GatewayConfig::default();
        let mut svc = service("http://127.0.0.1:9000");
        svc.queue_size = 0;
        config.services.insert("svc-a".into(), svc);

        let errs = validate_config(&config).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].0.contains("queue_size"));
    }

    #[test]
    fn unknown_strategy_rejected() {
        let mut config = GatewayConfig::default();
        let mut svc = service("http://127.0.0.1:9000");
        svc.strategy = Some("no_such_strategy".into());
        config.services.insert("svc-a".into(), svc);

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("unknown strategy"));
    }

    #[test]
    fn dangling_model_mapping_rejected() {
        let mut config = GatewayConfig::default();
        let mut svc = service("http://127.0.0.1:9000");
        svc.routing
            .by_model
            .insert("m1".into(), "http://10.0.0.9:9000".parse().unwrap());
        config.services.insert("svc-a".into(), svc);

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("not a configured instance"));
    }

    #[test]
    fn remote_without_executor_rejected() {
        let mut config = GatewayConfig::default();
        let mut svc = service("http://127.0.0.1:9000");
        svc.remote = Some(RemoteConfig {
            enabled: true,
            machine_id: "m1".into(),
            start_template_id: "1".into(),
            stop_template_id: "2".into(),
            ..RemoteConfig::default()
        });
        config.services.insert("svc-a".into(), svc);

        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("executor.base_url"));
    }

    #[test]
    fn missing_default_service_rejected() {
        let mut config = GatewayConfig::default();
        config.default_service = Some("ghost".into());
        let errs = validate_config(&config).unwrap_err();
        assert!(errs[0].0.contains("default_service"));
    }
}
