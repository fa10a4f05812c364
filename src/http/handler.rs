//! Per-request handling for both service roles.
//!
//! # Data Flow
//! ```text
//! RECEIVED
//!     → CONTEXT_RESOLVED   (extract inbound context or start a trace, open span)
//!     → WORKLOAD_RUNNING   (simulated work; edge also calls downstream)
//!     → RECORDED           (one metric sample, one log record, one span)
//!     → RESPONDED | RESPONDED_ERROR
//! ```
//!
//! # Design Decisions
//! - Recording happens in exactly one place, `RequestScope::record`
//! - A request dropped before RECORDED is recorded as `cancelled` on drop
//! - A panicking workload is caught and answered like a failed one
//! - Bodies never carry internal error text

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use metrics_exporter_prometheus::BuildError;
use opentelemetry::trace::Status;
use opentelemetry_otlp::ExporterBuildError;
use thiserror::Error;

use crate::config::{Role, ServiceConfig};
use crate::http::client::{DownstreamFailure, EdgeClient};
use crate::observability::logging::{LogLevel, Tags};
use crate::observability::metrics::{otlp_meter_provider, LATENCY_BUCKETS};
use crate::observability::{
    ActiveSpan, CompositePropagator, MetricsRegistry, Outcome, ServiceMetrics, StructuredLogger,
    TraceContext, Tracer,
};
use crate::workload::{Workload, WorkloadError};

/// Response header echoing the request's trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

pub const EDGE_ROUTE: &str = "/";
pub const DOWNSTREAM_ROUTE: &str = "/process";

/// Downstream acknowledgment.
pub const DOWNSTREAM_BODY: &str = "Processed data in Backend!";
/// Edge answer when the downstream call failed.
pub const DEGRADED_BODY: &str = "Frontend received: backend unavailable";
/// Answer when the workload itself failed.
pub const FAILURE_BODY: &str = "Internal error while processing request";

/// Request lifecycle stage. Ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    ContextResolved,
    WorkloadRunning,
    Recorded,
    Responded,
    RespondedError,
}

/// Failure building the telemetry stack.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("failed to build metrics recorder: {0}")]
    Metrics(#[from] BuildError),

    #[error("failed to build sink client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to build OTLP exporter: {0}")]
    Otlp(#[from] ExporterBuildError),
}

/// Everything a handler records into, constructed once per process and
/// passed down.
#[derive(Debug, Clone)]
pub struct ServiceTelemetry {
    pub metrics: ServiceMetrics,
    pub logger: StructuredLogger,
    pub tracer: Tracer,
    pub propagator: Arc<CompositePropagator>,
}

impl ServiceTelemetry {
    pub fn new(
        metrics: ServiceMetrics,
        logger: StructuredLogger,
        tracer: Tracer,
        propagator: Arc<CompositePropagator>,
    ) -> Self {
        Self {
            metrics,
            logger,
            tracer,
            propagator,
        }
    }

    /// Build registry, sinks and propagator from configuration. Remote sinks
    /// are spawned only for configured endpoints, so this must run inside a
    /// Tokio runtime when any are set.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, TelemetryError> {
        let name = config.service.name.as_str();
        let telemetry = &config.telemetry;

        let series_idle = (telemetry.series_idle_secs > 0)
            .then(|| Duration::from_secs(telemetry.series_idle_secs));
        let registry = MetricsRegistry::with_options(LATENCY_BUCKETS, series_idle)?;
        let mut metrics = ServiceMetrics::new(registry, name, telemetry.trace_id_label);
        if let Some(endpoint) = &telemetry.metrics_endpoint {
            let provider = otlp_meter_provider(
                name,
                endpoint,
                Duration::from_millis(telemetry.metrics_interval_ms),
                Duration::from_millis(telemetry.export.timeout_ms),
            )?;
            metrics = metrics.with_push(provider);
        }

        let logger = match &telemetry.logs_endpoint {
            Some(endpoint) => StructuredLogger::loki(name, endpoint, &telemetry.export)?,
            None => StructuredLogger::local(name),
        };
        let tracer = match &telemetry.traces_endpoint {
            Some(endpoint) => Tracer::otlp(name, endpoint, &telemetry.export)?,
            None => Tracer::disabled(name),
        };
        let propagator = Arc::new(CompositePropagator::from_formats(&telemetry.propagation));

        tracing::info!(
            service = %name,
            logs_endpoint = telemetry.logs_endpoint.as_deref().unwrap_or("-"),
            traces_endpoint = telemetry.traces_endpoint.as_deref().unwrap_or("-"),
            metrics_endpoint = telemetry.metrics_endpoint.as_deref().unwrap_or("-"),
            propagation = ?propagator.names(),
            "Telemetry initialized"
        );

        Ok(Self::new(metrics, logger, tracer, propagator))
    }

    pub fn registry(&self) -> &MetricsRegistry {
        self.metrics.registry()
    }

    /// Wait for queued log records, spans and pushed metrics to be attempted.
    pub async fn flush(&self) {
        self.logger.flush().await;
        self.tracer.flush().await;
        self.metrics.flush().await;
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub status: StatusCode,
    pub body: String,
    /// This hop's context.
    pub context: TraceContext,
    pub outcome: Outcome,
    pub stage: Stage,
}

impl IntoResponse for HandlerResponse {
    fn into_response(self) -> Response {
        let trace_id = self.context.trace_id().to_string();
        let mut response = (self.status, self.body).into_response();
        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert(TRACE_ID_HEADER, value);
        }
        response
    }
}

enum Mode {
    Edge(EdgeClient),
    Downstream,
}

enum Failure {
    Workload(WorkloadError),
    Downstream(DownstreamFailure),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Workload(err) => fmt::Display::fmt(err, f),
            Failure::Downstream(err) => fmt::Display::fmt(err, f),
        }
    }
}

/// Inbound handler for one service role.
pub struct ServiceHandler {
    role: Role,
    telemetry: ServiceTelemetry,
    workload: Arc<dyn Workload>,
    mode: Mode,
}

impl ServiceHandler {
    /// Handler for `GET /` that calls downstream through `client`.
    pub fn edge(telemetry: ServiceTelemetry, workload: Arc<dyn Workload>, client: EdgeClient) -> Self {
        Self {
            role: Role::Edge,
            telemetry,
            workload,
            mode: Mode::Edge(client),
        }
    }

    /// Handler for `GET /process`.
    pub fn downstream(telemetry: ServiceTelemetry, workload: Arc<dyn Workload>) -> Self {
        Self {
            role: Role::Downstream,
            telemetry,
            workload,
            mode: Mode::Downstream,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn route(&self) -> &'static str {
        match self.mode {
            Mode::Edge(_) => EDGE_ROUTE,
            Mode::Downstream => DOWNSTREAM_ROUTE,
        }
    }

    pub fn telemetry(&self) -> &ServiceTelemetry {
        &self.telemetry
    }

    /// Run one request through every stage. Always produces a response.
    pub async fn handle(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> HandlerResponse {
        let mut scope = RequestScope::new(self, peer);

        let remote = self.telemetry.propagator.extract_remote(headers);
        let span = self.telemetry.tracer.start(self.span_name(), remote);
        let context = *span.context();
        scope.resolved(span);

        scope.advance(Stage::WorkloadRunning);
        let result = self.run(&context).await;

        let completion = match result {
            Ok(body) => Completion::success(body),
            Err(failure) => Completion::failure(failure),
        };
        scope.record(completion)
    }

    fn span_name(&self) -> String {
        format!("GET {}", self.route())
    }

    async fn run(&self, context: &TraceContext) -> Result<String, Failure> {
        AssertUnwindSafe(self.workload.run())
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload)))
            .map_err(Failure::Workload)?;

        match &self.mode {
            Mode::Edge(client) => client
                .call(context)
                .await
                .map(|body| format!("Frontend received: {}", body))
                .map_err(Failure::Downstream),
            Mode::Downstream => Ok(DOWNSTREAM_BODY.to_string()),
        }
    }

    fn completed_message(&self, peer: Option<SocketAddr>) -> String {
        match self.mode {
            Mode::Edge(_) => format!(
                "{}: request at '{}' endpoint completed",
                self.role.label(),
                self.route()
            ),
            Mode::Downstream => format!(
                "{}: Processing request from '{}'",
                self.role.label(),
                peer.map(|p| p.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            ),
        }
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> WorkloadError {
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(reason = %reason, "Workload panicked");
    WorkloadError(format!("panicked: {}", reason))
}

impl fmt::Debug for ServiceHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandler")
            .field("role", &self.role)
            .field("route", &self.route())
            .finish_non_exhaustive()
    }
}

struct Completion {
    status: StatusCode,
    body: String,
    outcome: Outcome,
    failure: Option<Failure>,
}

impl Completion {
    fn success(body: String) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            outcome: Outcome::Success,
            failure: None,
        }
    }

    fn failure(failure: Failure) -> Self {
        let (status, body) = match failure {
            Failure::Downstream(_) => (StatusCode::BAD_GATEWAY, DEGRADED_BODY),
            Failure::Workload(_) => (StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY),
        };
        Self {
            status,
            body: body.to_string(),
            outcome: Outcome::Error,
            failure: Some(failure),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: StatusCode::REQUEST_TIMEOUT,
            body: String::new(),
            outcome: Outcome::Cancelled,
            failure: None,
        }
    }
}

/// Request-local state. Records exactly once, either through `record` or,
/// if the request is abandoned first, on drop.
struct RequestScope<'a> {
    handler: &'a ServiceHandler,
    peer: Option<SocketAddr>,
    started: Instant,
    stage: Stage,
    span: Option<ActiveSpan>,
}

impl<'a> RequestScope<'a> {
    fn new(handler: &'a ServiceHandler, peer: Option<SocketAddr>) -> Self {
        Self {
            handler,
            peer,
            started: Instant::now(),
            stage: Stage::Received,
            span: None,
        }
    }

    fn resolved(&mut self, span: ActiveSpan) {
        self.span = Some(span);
        self.advance(Stage::ContextResolved);
    }

    fn advance(&mut self, stage: Stage) {
        tracing::trace!(from = ?self.stage, to = ?stage, "Request stage");
        self.stage = stage;
    }

    fn record(&mut self, completion: Completion) -> HandlerResponse {
        let elapsed = self.started.elapsed();
        let telemetry = &self.handler.telemetry;
        let mut span = match self.span.take() {
            Some(span) => span,
            None => telemetry.tracer.start(self.handler.span_name(), None),
        };
        let context = *span.context();

        telemetry
            .metrics
            .record_request(completion.outcome, elapsed, context.trace_id());

        let (level, message) = self.log_line(&completion);
        let tags = self.tags(&span, &completion, elapsed);
        telemetry.logger.log(level, message, tags);

        span.set_attribute("http.route", self.handler.route());
        span.set_attribute("http.status_code", completion.status.as_str());
        span.set_attribute("outcome", completion.outcome.as_str());
        if let Some(failure) = &completion.failure {
            span.set_attribute("error.message", failure.to_string());
        }
        let status = match (&completion.failure, completion.outcome) {
            (_, Outcome::Success) => Status::Ok,
            (Some(failure), _) => Status::error(failure.to_string()),
            (None, outcome) => Status::error(outcome.as_str()),
        };
        telemetry.tracer.finish(span, status);

        self.advance(Stage::Recorded);

        let stage = if completion.status.is_success() {
            Stage::Responded
        } else {
            Stage::RespondedError
        };
        HandlerResponse {
            status: completion.status,
            body: completion.body,
            context,
            outcome: completion.outcome,
            stage,
        }
    }

    fn log_line(&self, completion: &Completion) -> (LogLevel, String) {
        let label = self.handler.role.label();
        let route = self.handler.route();
        match (&completion.failure, completion.outcome) {
            (None, Outcome::Success) => (LogLevel::Info, self.handler.completed_message(self.peer)),
            (Some(Failure::Downstream(_)), _) => (
                LogLevel::Warning,
                format!("{}: request at '{}' endpoint degraded, downstream call failed", label, route),
            ),
            (Some(Failure::Workload(_)), _) => (
                LogLevel::Warning,
                format!("{}: request at '{}' endpoint failed", label, route),
            ),
            (None, _) => (
                LogLevel::Warning,
                format!("{}: request at '{}' endpoint cancelled", label, route),
            ),
        }
    }

    fn tags(&self, span: &ActiveSpan, completion: &Completion, elapsed: Duration) -> Tags {
        let context = span.context();
        let mut tags = Tags::new();
        tags.insert("trace_id".to_string(), context.trace_id().to_string());
        tags.insert("span_id".to_string(), context.span_id().to_string());
        if let Some(parent) = span.parent_span_id() {
            tags.insert("parent_span_id".to_string(), parent.to_string());
        }
        tags.insert("outcome".to_string(), completion.outcome.as_str().to_string());
        tags.insert("route".to_string(), self.handler.route().to_string());
        tags.insert("duration_ms".to_string(), elapsed.as_millis().to_string());
        if let Some(peer) = self.peer {
            tags.insert("peer".to_string(), peer.to_string());
        }
        match &completion.failure {
            Some(Failure::Downstream(err)) => {
                tags.insert("error_kind".to_string(), err.kind().to_string());
                tags.insert("error".to_string(), err.to_string());
            }
            Some(Failure::Workload(err)) => {
                tags.insert("error_kind".to_string(), "workload".to_string());
                tags.insert("error".to_string(), err.to_string());
            }
            None => {}
        }
        tags
    }
}

impl Drop for RequestScope<'_> {
    fn drop(&mut self) {
        if self.stage < Stage::Recorded {
            tracing::debug!(stage = ?self.stage, "Request abandoned before recording");
            self.record(Completion::cancelled());
        }
    }
}
