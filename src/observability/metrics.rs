//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Own a Prometheus recorder per process (injected, never installed globally)
//! - Hand out counter, histogram and gauge handles by name and labels
//! - Render the text exposition format for `/metrics`
//! - Optionally push the same instruments to an OTLP/HTTP metrics collector
//! - Read rendered values back for tests and diagnostics
//!
//! # Metrics
//! - `<service>_requests_total` (counter): requests handled, by outcome
//! - `<service>_request_latency_seconds` (histogram): handler duration, by outcome and trace_id
//! - `<service>_request_duration_seconds` (gauge): duration of the last finished request
//!
//! # Design Decisions
//! - Handles are atomics; recording never takes a lock held by rendering
//! - Histogram buckets are fixed so latency renders as `_bucket/_sum/_count`
//! - The duration gauge keeps only the last value; concurrent requests
//!   finishing out of order overwrite each other
//! - Per-trace histogram series expire after an idle period, so the
//!   exposition stays bounded under steady traffic

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Label, Level, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use metrics_util::MetricKindMask;
use opentelemetry::metrics::{self as otel, MeterProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

use crate::observability::context::TraceId;
use crate::observability::spans::service_resource;
use crate::observability::Outcome;

/// Latency buckets in seconds, covering the 0.1–2s simulated workload.
pub const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0];

static METADATA: Metadata<'static> = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));

/// Process-wide metric store with a pull-based text exposition.
///
/// Cloning is cheap and shares the underlying store.
#[derive(Clone)]
pub struct MetricsRegistry {
    recorder: Arc<PrometheusRecorder>,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, BuildError> {
        Self::with_buckets(LATENCY_BUCKETS)
    }

    pub fn with_buckets(buckets: &[f64]) -> Result<Self, BuildError> {
        Self::with_options(buckets, None)
    }

    /// Histogram series not updated for `histogram_idle` are dropped from
    /// the exposition. `None` keeps them forever.
    pub fn with_options(buckets: &[f64], histogram_idle: Option<Duration>) -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets(buckets)?
            .idle_timeout(MetricKindMask::HISTOGRAM, histogram_idle)
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self {
            recorder: Arc::new(recorder),
            handle,
        })
    }

    /// Monotonic counter for `name` with the given labels.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        self.recorder.register_counter(&key(name, labels), &METADATA)
    }

    /// Bucketed distribution for `name` with the given labels.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Histogram {
        self.recorder.register_histogram(&key(name, labels), &METADATA)
    }

    /// Last-value gauge for `name` with the given labels.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Gauge {
        self.recorder.register_gauge(&key(name, labels), &METADATA)
    }

    pub fn describe_counter(&self, name: &str, unit: Unit, description: &str) {
        self.recorder
            .describe_counter(key_name(name), Some(unit), SharedString::from(description.to_string()));
    }

    pub fn describe_histogram(&self, name: &str, unit: Unit, description: &str) {
        self.recorder
            .describe_histogram(key_name(name), Some(unit), SharedString::from(description.to_string()));
    }

    pub fn describe_gauge(&self, name: &str, unit: Unit, description: &str) {
        self.recorder
            .describe_gauge(key_name(name), Some(unit), SharedString::from(description.to_string()));
    }

    /// Render every registered metric in the Prometheus text format.
    ///
    /// Safe to call concurrently with recording. Names never registered are
    /// simply absent.
    pub fn export(&self) -> String {
        self.handle.render()
    }

    /// Parsed view of the current exposition.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::parse(&self.export())
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

fn key(name: &str, labels: &[(&str, &str)]) -> Key {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(k.to_string(), v.to_string()))
        .collect();
    Key::from_parts(name.to_string(), labels)
}

fn key_name(name: &str) -> KeyName {
    KeyName::from(name.to_string())
}

/// Periodic OTLP/HTTP push of the per-request instruments
/// (e.g. `http://127.0.0.1:4318/v1/metrics`).
pub fn otlp_meter_provider(
    service_name: &str,
    endpoint: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<SdkMeterProvider, ExporterBuildError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_timeout(timeout)
        .build()?;
    let reader = PeriodicReader::builder(exporter).with_interval(interval).build();

    Ok(SdkMeterProvider::builder()
        .with_resource(service_resource(service_name))
        .with_reader(reader)
        .build())
}

/// The request instruments mirrored onto an OpenTelemetry meter.
#[derive(Clone)]
struct PushInstruments {
    provider: SdkMeterProvider,
    requests_total: otel::Counter<u64>,
    request_latency: otel::Histogram<f64>,
    request_duration: otel::Gauge<f64>,
}

/// Instruments recorded once per handled request.
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: MetricsRegistry,
    requests_total: String,
    request_latency: String,
    request_duration: String,
    trace_id_label: bool,
    push: Option<PushInstruments>,
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics")
            .field("requests_total", &self.requests_total)
            .field("trace_id_label", &self.trace_id_label)
            .field("push", &self.push.is_some())
            .finish_non_exhaustive()
    }
}

impl ServiceMetrics {
    pub fn new(registry: MetricsRegistry, service_name: &str, trace_id_label: bool) -> Self {
        let prefix = metric_prefix(service_name);
        let metrics = Self {
            requests_total: format!("{}_requests_total", prefix),
            request_latency: format!("{}_request_latency_seconds", prefix),
            request_duration: format!("{}_request_duration_seconds", prefix),
            registry,
            trace_id_label,
            push: None,
        };

        metrics.registry.describe_counter(
            &metrics.requests_total,
            Unit::Count,
            "Total number of processed requests (counter)",
        );
        metrics.registry.describe_histogram(
            &metrics.request_latency,
            Unit::Seconds,
            "Latency for processing requests (histogram)",
        );
        metrics.registry.describe_gauge(
            &metrics.request_duration,
            Unit::Seconds,
            "Duration for processing single request (gauge)",
        );
        metrics
    }

    /// Also push every recording through `provider`'s readers.
    pub fn with_push(mut self, provider: SdkMeterProvider) -> Self {
        let meter = provider.meter(env!("CARGO_PKG_NAME"));
        let push = PushInstruments {
            requests_total: meter
                .u64_counter(self.requests_total.clone())
                .with_description("Total number of processed requests (counter)")
                .build(),
            request_latency: meter
                .f64_histogram(self.request_latency.clone())
                .with_unit("s")
                .with_description("Latency for processing requests (histogram)")
                .with_boundaries(LATENCY_BUCKETS.to_vec())
                .build(),
            request_duration: meter
                .f64_gauge(self.request_duration.clone())
                .with_unit("s")
                .with_description("Duration for processing single request (gauge)")
                .build(),
            provider,
        };
        self.push = Some(push);
        self
    }

    /// Record one finished request.
    pub fn record_request(&self, outcome: Outcome, duration: Duration, trace_id: TraceId) {
        let seconds = duration.as_secs_f64();
        let outcome = outcome.as_str();
        let trace_id = self.trace_id_label.then(|| trace_id.to_string());

        self.registry
            .counter(&self.requests_total, &[("outcome", outcome)])
            .increment(1);

        let mut labels = vec![("outcome", outcome)];
        if let Some(trace_id) = &trace_id {
            labels.push(("trace_id", trace_id.as_str()));
        }
        self.registry
            .histogram(&self.request_latency, &labels)
            .record(seconds);

        self.registry.gauge(&self.request_duration, &[]).set(seconds);

        if let Some(push) = &self.push {
            let attributes: Vec<KeyValue> = labels
                .iter()
                .map(|(k, v)| KeyValue::new(*k, v.to_string()))
                .collect();
            push.requests_total.add(1, &attributes[..1]);
            push.request_latency.record(seconds, &attributes);
            push.request_duration.record(seconds, &[]);
        }
    }

    /// Push pending measurements now. No-op without a push provider.
    pub async fn flush(&self) {
        let Some(push) = &self.push else {
            return;
        };
        let provider = push.provider.clone();
        match tokio::task::spawn_blocking(move || provider.force_flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Metrics push failed"),
            Err(e) => tracing::warn!(error = %e, "Metrics push task failed"),
        }
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn requests_total_name(&self) -> &str {
        &self.requests_total
    }

    pub fn request_latency_name(&self) -> &str {
        &self.request_latency
    }

    pub fn request_duration_name(&self) -> &str {
        &self.request_duration
    }
}

/// Prometheus metric names allow `[a-zA-Z0-9_:]`.
fn metric_prefix(service_name: &str) -> String {
    service_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// One exposition line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    fn matches(&self, name: &str, labels: &[(&str, &str)]) -> bool {
        self.name == name
            && labels
                .iter()
                .all(|(k, v)| self.labels.get(*k).map(String::as_str) == Some(*v))
    }
}

/// Totals for one histogram, summed over every series matching a label filter.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    /// Cumulative counts by upper bound; the last bound is `+Inf`.
    pub buckets: Vec<(f64, u64)>,
}

/// Parsed Prometheus text exposition.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    samples: Vec<Sample>,
}

impl MetricsSnapshot {
    /// Parse the text format. Comment lines and lines that do not parse are skipped.
    pub fn parse(text: &str) -> Self {
        let samples = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_sample)
            .collect();
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Whether any series named `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.samples.iter().any(|s| s.name == name)
    }

    /// Sum over every series named `name` whose labels include `labels`.
    pub fn sum(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let mut matched = self.samples.iter().filter(|s| s.matches(name, labels)).peekable();
        matched.peek()?;
        Some(matched.map(|s| s.value).sum())
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        self.sum(name, labels).map(|v| v as u64)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.matches(name, labels))
            .map(|s| s.value)
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSummary> {
        let count = self.sum(&format!("{}_count", name), labels)?;
        let sum = self.sum(&format!("{}_sum", name), labels).unwrap_or(0.0);

        let bucket_name = format!("{}_bucket", name);
        let mut buckets: BTreeMap<u64, (f64, u64)> = BTreeMap::new();
        for sample in self.samples.iter().filter(|s| s.matches(&bucket_name, labels)) {
            let Some(bound) = sample.labels.get("le").and_then(|le| parse_bound(le)) else {
                continue;
            };
            // f64 bounds are ordered through their bit patterns (all non-negative)
            let entry = buckets.entry(bound.to_bits()).or_insert((bound, 0));
            entry.1 += sample.value as u64;
        }

        Some(HistogramSummary {
            count: count as u64,
            sum,
            buckets: buckets.into_values().collect(),
        })
    }
}

fn parse_bound(le: &str) -> Option<f64> {
    match le {
        "+Inf" => Some(f64::INFINITY),
        other => other.parse().ok(),
    }
}

fn parse_sample(line: &str) -> Option<Sample> {
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            if close < open {
                return None;
            }
            (
                &line[..open],
                parse_labels(&line[open + 1..close])?,
                &line[close + 1..],
            )
        }
        None => {
            let (name, rest) = line.split_once(char::is_whitespace)?;
            (name, BTreeMap::new(), rest)
        }
    };

    let value = rest.split_whitespace().next()?;
    let value = match value {
        "+Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        other => other.parse().ok()?,
    };

    Some(Sample {
        name: name.trim().to_string(),
        labels,
        value,
    })
}

fn parse_labels(body: &str) -> Option<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    let mut chars = body.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            return Some(labels);
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if chars.next()? != '"' {
            return None;
        }

        let mut value = String::new();
        loop {
            match chars.next()? {
                '"' => break,
                '\\' => match chars.next()? {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                c => value.push(c),
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
}
