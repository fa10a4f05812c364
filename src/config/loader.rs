//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ServiceConfig;
use crate::config::validation::{validate_config, ValidationError};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = toml::from_str(content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::Role;
    use crate::observability::propagation::PropagationFormat;

    #[test]
    fn test_parse_downstream_config() {
        let config = parse_config(
            r#"
            [service]
            name = "cheshire"
            role = "downstream"

            [listener]
            host = "127.0.0.1"
            port = 5001

            [telemetry]
            logs_endpoint = "http://127.0.0.1:3100/loki/api/v1/push"
            propagation = ["jaeger", "tracecontext"]
            "#,
        )
        .unwrap();

        assert_eq!(config.role(), Role::Downstream);
        assert_eq!(config.listener.bind_address(), "127.0.0.1:5001");
        assert_eq!(
            config.telemetry.propagation,
            vec![PropagationFormat::Jaeger, PropagationFormat::TraceContext]
        );
        // Untouched sections keep their defaults
        assert_eq!(config.workload.max_delay_ms, 2_000);
        assert!(config.telemetry.trace_id_label);
    }

    #[test]
    fn test_empty_file_is_edge_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.role(), Role::Edge);
        assert_eq!(config.service.name, "alice");
        assert_eq!(
            config.downstream.url.as_deref(),
            Some("http://127.0.0.1:5001/process")
        );
    }

    #[test]
    fn test_parse_error() {
        let err = parse_config("[service\nname = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_errors_are_surfaced() {
        let err = parse_config(
            r#"
            [service]
            role = "edge"

            [downstream]
            url = "not a url"
            "#,
        )
        .unwrap_err();

        match err {
            ConfigError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "downstream.url"));
            }
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/looking-glass.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
