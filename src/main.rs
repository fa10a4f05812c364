//! looking-glass
//!
//! One binary, two roles of a traced request chain.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────┐             ┌──────────────────────┐
//!   GET /  ────────▶│  edge (alice :5000)  │── GET ─────▶│ downstream (cheshire │
//!                   │                      │ /process    │        :5001)        │
//!   ◀──────────────│  Frontend received:  │ traceparent │ Processed data in    │
//!                   └──────────┬───────────┘◀────────────└──────────┬───────────┘
//!                              │                                    │
//!             ┌────────────────┼────────────────┬───────────────────┤
//!             ▼                ▼                ▼                   ▼
//!        /metrics          Loki push       OTLP/HTTP           /metrics
//!      (Prometheus)         (logs)          (spans)          (Prometheus)
//! ```
//!
//! Every hop records, under the request's trace id, one latency sample,
//! one log line and one span.

use std::path::PathBuf;

use clap::Parser;

use looking_glass::config::{load_config, validate_config, ConfigError, Role, ServiceConfig};
use looking_glass::lifecycle::startup;
use looking_glass::observability::logging::init_subscriber;

/// Traced edge/downstream service.
#[derive(Debug, Parser)]
#[command(name = "looking-glass", version, about)]
struct Cli {
    /// TOML configuration file. Role defaults apply when omitted.
    #[arg(short, long, env = "LOOKING_GLASS_CONFIG")]
    config: Option<PathBuf>,

    /// Role to run.
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// Service name (metric prefix and log stream label).
    #[arg(long)]
    name: Option<String>,

    /// Bind host.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Downstream URL (edge role).
    #[arg(long)]
    downstream_url: Option<String>,

    /// Loki push endpoint.
    #[arg(long)]
    logs_endpoint: Option<String>,

    /// OTLP/HTTP traces endpoint.
    #[arg(long)]
    traces_endpoint: Option<String>,

    /// Raise local log verbosity to debug.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Result<ServiceConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServiceConfig::for_role(self.role.unwrap_or(Role::Edge)),
        };

        if let Some(role) = self.role {
            config.service.role = role;
        }
        if let Some(name) = self.name {
            config.service.name = name;
        }
        if let Some(host) = self.host {
            config.listener.host = host;
        }
        if let Some(port) = self.port {
            config.listener.port = port;
        }
        if let Some(url) = self.downstream_url {
            config.downstream.url = Some(url);
        }
        if let Some(endpoint) = self.logs_endpoint {
            config.telemetry.logs_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = self.traces_endpoint {
            config.telemetry.traces_endpoint = Some(endpoint);
        }
        config.service.debug |= self.debug;

        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;

    init_subscriber(&config.telemetry.log_level, config.service.debug);
    tracing::info!("looking-glass v{} starting", env!("CARGO_PKG_VERSION"));

    startup::run(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
