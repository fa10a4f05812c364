//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check role requirements (edge needs a downstream URL)
//! - Validate value ranges (timeouts > 0, delay bounds ordered)
//! - Check telemetry endpoints parse as HTTP URLs
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{Role, ServiceConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let name = &config.service.name;
    if name.is_empty() {
        errors.push(ValidationError::new("service.name", "must not be empty"));
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        errors.push(ValidationError::new(
            "service.name",
            format!("'{}' may only contain ASCII letters, digits, '_' and '-'", name),
        ));
    }

    if config.listener.host.is_empty() {
        errors.push(ValidationError::new("listener.host", "must not be empty"));
    }

    match (config.role(), config.downstream.url.as_deref()) {
        (Role::Edge, None) => {
            errors.push(ValidationError::new(
                "downstream.url",
                "required when role is edge",
            ));
        }
        (_, Some(raw)) => {
            // The edge client speaks plain HTTP only
            if let Err(message) = check_url(raw, &["http"]) {
                errors.push(ValidationError::new("downstream.url", message));
            }
        }
        (Role::Downstream, None) => {}
    }

    if config.downstream.timeout_ms == 0 {
        errors.push(ValidationError::new("downstream.timeout_ms", "must be greater than 0"));
    }
    if config.downstream.connect_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "downstream.connect_timeout_ms",
            "must be greater than 0",
        ));
    }

    if config.workload.min_delay_ms > config.workload.max_delay_ms {
        errors.push(ValidationError::new(
            "workload.min_delay_ms",
            format!(
                "{} exceeds max_delay_ms {}",
                config.workload.min_delay_ms, config.workload.max_delay_ms
            ),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    } else {
        // A request cut off by the server timeout gets a bare 408 instead of
        // the role's text body
        let worst_case_ms = match config.role() {
            Role::Edge => config
                .workload
                .max_delay_ms
                .saturating_add(config.downstream.timeout_ms),
            Role::Downstream => config.workload.max_delay_ms,
        };
        let request_ms = config.timeouts.request_secs.saturating_mul(1_000);
        if request_ms <= worst_case_ms {
            errors.push(ValidationError::new(
                "timeouts.request_secs",
                format!(
                    "{}s does not cover the slowest handled request ({}ms of workload and downstream time)",
                    config.timeouts.request_secs, worst_case_ms
                ),
            ));
        }
    }

    let telemetry = &config.telemetry;
    if let Some(raw) = telemetry.traces_endpoint.as_deref() {
        if let Err(message) = check_url(raw, &["http", "https"]) {
            errors.push(ValidationError::new("telemetry.traces_endpoint", message));
        }
    }
    if let Some(raw) = telemetry.logs_endpoint.as_deref() {
        if let Err(message) = check_url(raw, &["http", "https"]) {
            errors.push(ValidationError::new("telemetry.logs_endpoint", message));
        }
    }
    if let Some(raw) = telemetry.metrics_endpoint.as_deref() {
        if let Err(message) = check_url(raw, &["http", "https"]) {
            errors.push(ValidationError::new("telemetry.metrics_endpoint", message));
        }
    }
    if telemetry.metrics_interval_ms == 0 {
        errors.push(ValidationError::new(
            "telemetry.metrics_interval_ms",
            "must be greater than 0",
        ));
    }
    if let Some(raw) = telemetry.metrics_address.as_deref() {
        if raw.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "telemetry.metrics_address",
                format!("'{}' is not a socket address", raw),
            ));
        }
    }
    if telemetry.propagation.is_empty() {
        errors.push(ValidationError::new(
            "telemetry.propagation",
            "at least one format is required",
        ));
    }

    let export = &telemetry.export;
    if export.timeout_ms == 0 {
        errors.push(ValidationError::new("telemetry.export.timeout_ms", "must be greater than 0"));
    }
    if export.queue_capacity == 0 {
        errors.push(ValidationError::new(
            "telemetry.export.queue_capacity",
            "must be greater than 0",
        ));
    }
    if export.batch_size == 0 {
        errors.push(ValidationError::new("telemetry.export.batch_size", "must be greater than 0"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("'{}' is not a valid URL: {}", raw, e))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "scheme '{}' not supported (expected {})",
            url.scheme(),
            schemes.join(" or ")
        ));
    }
    if url.host_str().is_none() {
        return Err(format!("'{}' has no host", raw));
    }
    Ok(())
}
