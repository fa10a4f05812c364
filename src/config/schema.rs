//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::observability::propagation::PropagationFormat;

/// Which side of the request chain this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// First service to see the external request; calls downstream.
    Edge,
    /// Leaf service called by the edge.
    Downstream,
}

impl Role {
    /// Human label used in log messages.
    pub const fn label(self) -> &'static str {
        match self {
            Role::Edge => "Frontend",
            Role::Downstream => "Backend",
        }
    }
}

/// Root configuration for a service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service identity.
    pub service: ServiceIdentity,

    /// Listener configuration (bind host and port).
    pub listener: ListenerConfig,

    /// Downstream call settings (edge only).
    pub downstream: DownstreamConfig,

    /// Simulated workload settings.
    pub workload: WorkloadConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Telemetry sinks and local logging.
    pub telemetry: TelemetryConfig,
}

impl ServiceConfig {
    /// Defaults for the given role, matching the two-service demo layout
    /// (`alice` on 5000 calling `cheshire` on 5001).
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Edge => Self {
                service: ServiceIdentity {
                    name: "alice".to_string(),
                    role,
                    debug: false,
                },
                listener: ListenerConfig {
                    host: "0.0.0.0".to_string(),
                    port: 5000,
                },
                downstream: DownstreamConfig::default(),
                workload: WorkloadConfig::default(),
                timeouts: TimeoutConfig::default(),
                telemetry: TelemetryConfig::default(),
            },
            Role::Downstream => Self {
                service: ServiceIdentity {
                    name: "cheshire".to_string(),
                    role,
                    debug: false,
                },
                listener: ListenerConfig {
                    host: "0.0.0.0".to_string(),
                    port: 5001,
                },
                downstream: DownstreamConfig {
                    url: None,
                    ..DownstreamConfig::default()
                },
                workload: WorkloadConfig::default(),
                timeouts: TimeoutConfig::default(),
                telemetry: TelemetryConfig::default(),
            },
        }
    }

    pub fn role(&self) -> Role {
        self.service.role
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::for_role(Role::Edge)
    }
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceIdentity {
    /// Service name, used as metric prefix and log stream label.
    pub name: String,

    /// Edge or downstream.
    pub role: Role,

    /// Raise local log verbosity to debug.
    pub debug: bool,
}

impl Default for ServiceIdentity {
    fn default() -> Self {
        Self {
            name: "alice".to_string(),
            role: Role::Edge,
            debug: false,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind host (e.g., "0.0.0.0").
    pub host: String,

    /// Bind port. Zero picks an ephemeral port.
    pub port: u16,
}

impl ListenerConfig {
    /// `host:port` form accepted by `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// Outbound call settings for the edge service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DownstreamConfig {
    /// Full URL of the downstream endpoint (e.g., "http://127.0.0.1:5001/process").
    pub url: Option<String>,

    /// Total time allowed for the downstream call, in milliseconds.
    pub timeout_ms: u64,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            url: Some("http://127.0.0.1:5001/process".to_string()),
            timeout_ms: 5_000,
            connect_timeout_ms: 1_000,
        }
    }
}

/// Simulated workload: a uniformly random delay per request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

/// Timeout configuration for inbound requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Local log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// OTLP/HTTP traces endpoint (e.g., "http://127.0.0.1:4318/v1/traces").
    pub traces_endpoint: Option<String>,

    /// Loki push endpoint (e.g., "http://127.0.0.1:3100/loki/api/v1/push").
    pub logs_endpoint: Option<String>,

    /// Dedicated scrape address; `/metrics` is always served on the main
    /// listener as well.
    pub metrics_address: Option<String>,

    /// OTLP/HTTP metrics collector (e.g., "http://127.0.0.1:4318/v1/metrics").
    /// Pushes run alongside the `/metrics` scrape endpoint.
    pub metrics_endpoint: Option<String>,

    /// Interval between metric pushes in milliseconds.
    pub metrics_interval_ms: u64,

    /// Attach `trace_id` as a label on latency histograms.
    pub trace_id_label: bool,

    /// Seconds after which a latency series with no new samples is dropped
    /// from `/metrics`. Zero keeps series forever.
    pub series_idle_secs: u64,

    /// Propagation formats, in extraction priority order.
    pub propagation: Vec<PropagationFormat>,

    /// Background export settings shared by the log and span sinks.
    pub export: ExportConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            traces_endpoint: None,
            logs_endpoint: None,
            metrics_address: None,
            metrics_endpoint: None,
            metrics_interval_ms: 10_000,
            trace_id_label: true,
            series_idle_secs: 300,
            propagation: vec![PropagationFormat::TraceContext],
            export: ExportConfig::default(),
        }
    }
}

/// Bounded, batching background export.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Per-push HTTP timeout in milliseconds.
    pub timeout_ms: u64,

    /// Items that may wait for delivery before new ones are diverted to the fallback.
    pub queue_capacity: usize,

    /// Maximum items per push.
    pub batch_size: usize,

    /// Undelivered items kept locally, oldest evicted first.
    pub fallback_capacity: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            queue_capacity: 1_024,
            batch_size: 64,
            fallback_capacity: 256,
        }
    }
}
