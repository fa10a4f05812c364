//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the local `tracing` subscriber (stderr)
//! - Build correlated log records carrying `trace_id` and `span_id` tags
//! - Ship records to a Loki-compatible push endpoint off the request path
//!
//! # Design Decisions
//! - Every record is mirrored locally, so an unreachable sink loses nothing
//!   an operator can't still see on stderr
//! - The shipped line is the message followed by logfmt tags, which Grafana
//!   derived fields can match on `trace_id=(\w+)`
//! - Stream labels stay low-cardinality (application, level); ids live in the line

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ExportConfig;
use crate::observability::export::{ExportError, Exporter, Sink};

/// Install the process-wide `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `log_level` applies, or `debug` when
/// `debug` is true.
pub fn init_subscriber(log_level: &str, debug: bool) {
    let default_filter = if debug { "debug" } else { log_level };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation tags attached to a record. Ordered so rendered lines are stable.
pub type Tags = BTreeMap<String, String>;

/// Build [`Tags`] from borrowed pairs.
pub fn tags(pairs: &[(&str, &str)]) -> Tags {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// One structured log event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub level: LogLevel,
    pub service_name: String,
    pub message: String,
    pub tags: Tags,
}

impl LogRecord {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Tags in logfmt (`key=value key2="with space"`).
    pub fn logfmt_tags(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.tags {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}={}", key, logfmt_value(value));
        }
        out
    }

    /// Shipped line: message, then logfmt tags.
    pub fn line(&self) -> String {
        if self.tags.is_empty() {
            self.message.clone()
        } else {
            format!("{} {}", self.message, self.logfmt_tags())
        }
    }

    fn unix_nanos(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    }
}

fn logfmt_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '=' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// Logger bound to one service.
///
/// Cloning shares the export queue.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    service_name: String,
    exporter: Option<Exporter<LogRecord>>,
}

impl StructuredLogger {
    pub fn new(service_name: impl Into<String>, exporter: Option<Exporter<LogRecord>>) -> Self {
        Self {
            service_name: service_name.into(),
            exporter,
        }
    }

    /// Logger that only writes to the local subscriber.
    pub fn local(service_name: impl Into<String>) -> Self {
        Self::new(service_name, None)
    }

    /// Logger shipping to a Loki push endpoint. Must be called inside a Tokio runtime.
    pub fn loki(
        service_name: impl Into<String>,
        endpoint: &str,
        config: &ExportConfig,
    ) -> Result<Self, reqwest::Error> {
        let service_name = service_name.into();
        let sink = LokiSink::new(endpoint, Duration::from_millis(config.timeout_ms))?;
        Ok(Self::new(service_name, Some(Exporter::spawn(sink, config))))
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn info(&self, message: impl Into<String>, tags: Tags) {
        self.log(LogLevel::Info, message, tags);
    }

    pub fn warning(&self, message: impl Into<String>, tags: Tags) {
        self.log(LogLevel::Warning, message, tags);
    }

    pub fn error(&self, message: impl Into<String>, tags: Tags) {
        self.log(LogLevel::Error, message, tags);
    }

    /// Emit one record: mirrored locally, then queued for the remote sink.
    /// Never blocks on and never fails because of the sink.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, tags: Tags) {
        let record = LogRecord {
            timestamp: SystemTime::now(),
            level,
            service_name: self.service_name.clone(),
            message: message.into(),
            tags,
        };

        let trace_id = record.tag("trace_id").unwrap_or("-");
        let fields = record.logfmt_tags();
        match level {
            LogLevel::Info => tracing::info!(
                service = %record.service_name,
                trace_id = %trace_id,
                tags = %fields,
                "{}",
                record.message
            ),
            LogLevel::Warning => tracing::warn!(
                service = %record.service_name,
                trace_id = %trace_id,
                tags = %fields,
                "{}",
                record.message
            ),
            LogLevel::Error => tracing::error!(
                service = %record.service_name,
                trace_id = %trace_id,
                tags = %fields,
                "{}",
                record.message
            ),
        }

        if let Some(exporter) = &self.exporter {
            exporter.export(record);
        }
    }

    /// Wait for queued records to be attempted.
    pub async fn flush(&self) {
        if let Some(exporter) = &self.exporter {
            exporter.flush().await;
        }
    }

    pub fn exporter(&self) -> Option<&Exporter<LogRecord>> {
        self.exporter.as_ref()
    }
}

/// Loki HTTP push API sink (`POST /loki/api/v1/push`).
pub struct LokiSink {
    client: reqwest::Client,
    endpoint: String,
}

impl LokiSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Sink<LogRecord> for LokiSink {
    fn name(&self) -> &'static str {
        "loki"
    }

    async fn push(&self, batch: &[LogRecord]) -> Result<(), ExportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&loki_payload(batch))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Push body, one stream per (application, level).
pub fn loki_payload(batch: &[LogRecord]) -> serde_json::Value {
    let mut streams: BTreeMap<(&str, LogLevel), Vec<serde_json::Value>> = BTreeMap::new();
    for record in batch {
        streams
            .entry((record.service_name.as_str(), record.level))
            .or_default()
            .push(json!([record.unix_nanos().to_string(), record.line()]));
    }

    let streams: Vec<serde_json::Value> = streams
        .into_iter()
        .map(|((application, level), values)| {
            json!({
                "stream": { "application": application, "level": level.as_str() },
                "values": values,
            })
        })
        .collect();

    json!({ "streams": streams })
}
