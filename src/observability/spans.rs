//! Span recording through the OpenTelemetry SDK.
//!
//! Each hop records one server span covering the whole handler invocation.
//! A continued trace parents the span on the remote context; otherwise the
//! span starts a new trace. The SDK mints the span id, and this hop's
//! [`TraceContext`] is read back from the opened span, so the id in logs,
//! metrics and outbound headers is the one the collector sees.
//!
//! Finished spans are batched off the request path and posted to an
//! OTLP/HTTP collector (`/v1/traces`).

use std::time::Duration;

use opentelemetry::trace::{Span as _, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig};
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider};
use opentelemetry_sdk::Resource;

use crate::config::ExportConfig;
use crate::observability::context::{SpanId, TraceContext};

/// Resource attributes identifying `service_name` to the collector.
pub fn service_resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_attributes([KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))])
        .build()
}

/// A span that has started and not yet finished.
#[derive(Debug)]
pub struct ActiveSpan {
    span: opentelemetry_sdk::trace::Span,
    context: TraceContext,
    parent_span_id: Option<SpanId>,
}

impl ActiveSpan {
    /// This hop's context, as minted by the SDK.
    pub fn context(&self) -> &TraceContext {
        &self.context
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn set_attribute(&mut self, key: &'static str, value: impl Into<String>) {
        self.span.set_attribute(KeyValue::new(key, value.into()));
    }
}

/// Opens and closes spans for one service.
#[derive(Debug, Clone)]
pub struct Tracer {
    provider: SdkTracerProvider,
    tracer: SdkTracer,
}

impl Tracer {
    pub fn new(service_name: &str, provider: SdkTracerProvider) -> Self {
        let tracer = provider.tracer(service_name.to_string());
        Self { provider, tracer }
    }

    /// Ids are still minted and sampled, nothing leaves the process.
    pub fn disabled(service_name: &str) -> Self {
        let provider = SdkTracerProvider::builder()
            .with_resource(service_resource(service_name))
            .build();
        Self::new(service_name, provider)
    }

    /// Batch export to an OTLP/HTTP traces endpoint
    /// (e.g. `http://127.0.0.1:4318/v1/traces`).
    pub fn otlp(
        service_name: &str,
        endpoint: &str,
        config: &ExportConfig,
    ) -> Result<Self, ExporterBuildError> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_queue_size(config.queue_capacity.max(1))
                    .with_max_export_batch_size(config.batch_size.max(1))
                    .build(),
            )
            .build();

        let provider = SdkTracerProvider::builder()
            .with_resource(service_resource(service_name))
            .with_span_processor(processor)
            .build();
        Ok(Self::new(service_name, provider))
    }

    /// Open a server span. With `remote`, the span continues that trace as
    /// its child; without, it starts a new trace.
    pub fn start(&self, name: impl Into<String>, remote: Option<TraceContext>) -> ActiveSpan {
        let parent = match remote {
            Some(remote) => Context::new().with_remote_span_context(remote.to_span_context(true)),
            None => Context::new(),
        };

        let span = self
            .tracer
            .span_builder(name.into())
            .with_kind(SpanKind::Server)
            .start_with_context(&self.tracer, &parent);
        let context = TraceContext::from_span_context(span.span_context());

        ActiveSpan {
            span,
            context,
            parent_span_id: remote.map(|remote| remote.span_id()),
        }
    }

    /// Close the span. The SDK drops unsampled spans instead of exporting them.
    pub fn finish(&self, mut span: ActiveSpan, status: Status) {
        span.span.set_status(status);
        span.span.end();
    }

    /// Wait for finished spans to be handed to the exporter.
    pub async fn flush(&self) {
        let provider = self.provider.clone();
        match tokio::task::spawn_blocking(move || provider.force_flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Span flush failed"),
            Err(e) => tracing::warn!(error = %e, "Span flush task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::context::TraceId;
    use opentelemetry::trace::SpanId as OtelSpanId;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    fn capturing_tracer() -> (Tracer, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (Tracer::new("cheshire", provider), exporter)
    }

    #[test]
    fn test_child_of_remote_context() {
        let (tracer, exporter) = capturing_tracer();
        let remote = TraceContext::new_trace();

        let mut span = tracer.start("GET /process", Some(remote));
        let local = *span.context();
        span.set_attribute("http.route", "/process");
        tracer.finish(span, Status::Ok);

        assert_eq!(local.trace_id(), remote.trace_id());
        assert_ne!(local.span_id(), remote.span_id());

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(TraceId::from(span.span_context.trace_id()), remote.trace_id());
        assert_eq!(SpanId::from(span.span_context.span_id()), local.span_id());
        assert_eq!(SpanId::from(span.parent_span_id), remote.span_id());
        assert_eq!(span.span_kind, SpanKind::Server);
        assert_eq!(span.status, Status::Ok);
        assert!(span
            .attributes
            .iter()
            .any(|kv| kv.key.as_str() == "http.route" && kv.value.as_str() == "/process"));
    }

    #[test]
    fn test_root_span_starts_new_trace() {
        let (tracer, exporter) = capturing_tracer();

        let span = tracer.start("GET /", None);
        let context = *span.context();
        assert!(context.is_valid());
        assert!(context.is_sampled());
        assert_eq!(span.parent_span_id(), None);
        tracer.finish(span, Status::error("boom"));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans[0].parent_span_id, OtelSpanId::INVALID);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[test]
    fn test_unsampled_remote_is_not_exported() {
        let (tracer, exporter) = capturing_tracer();
        let remote = TraceContext::from_parts(TraceId::random(), SpanId::random(), false);

        let span = tracer.start("GET /process", Some(remote));
        assert!(!span.context().is_sampled());
        assert_eq!(span.context().trace_id(), remote.trace_id());
        tracer.finish(span, Status::Ok);

        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tracer_still_mints_ids() {
        let tracer = Tracer::disabled("alice");
        let first = tracer.start("GET /", None);
        let second = tracer.start("GET /", None);

        assert!(first.context().is_valid());
        assert_ne!(first.context().trace_id(), second.context().trace_id());
        tracer.finish(first, Status::Ok);
        tracer.finish(second, Status::Ok);
        tracer.flush().await;
    }
}
