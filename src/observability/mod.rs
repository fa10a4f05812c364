//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every handled request produces, under one trace_id:
//!     → context.rs + propagation/ (trace and span ids, wire headers)
//!     → metrics.rs (counter, latency histogram, duration gauge)
//!     → logging.rs (one structured log record)
//!     → spans.rs (one finished span)
//!
//! Consumers:
//!     → Metrics endpoint (Prometheus scrape of /metrics, optional OTLP push)
//!     → Log aggregation (Loki push, via export.rs)
//!     → Trace collector (OTLP/HTTP, via the OpenTelemetry batch processor)
//! ```
//!
//! # Design Decisions
//! - Trace id flows through all three signals as the join key
//! - Metrics are cheap (atomic increments), shipping is off the request path
//! - Sink outages degrade telemetry, never requests

pub mod context;
pub mod export;
pub mod logging;
pub mod metrics;
pub mod propagation;
pub mod spans;

use std::fmt;

pub use context::{SpanId, TraceContext, TraceId};
pub use logging::{LogLevel, LogRecord, StructuredLogger};
pub use metrics::{MetricsRegistry, MetricsSnapshot, ServiceMetrics};
pub use propagation::{CompositePropagator, PropagationFormat};
pub use spans::{ActiveSpan, Tracer};

/// How a handled request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Error,
    /// The request was abandoned before a response was produced.
    Cancelled,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
