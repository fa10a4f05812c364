//! Trace context propagation across HTTP hops.
//!
//! # Data Flow
//! ```text
//! inbound headers ──▶ CompositePropagator::extract ──▶ Result<TraceContext, ExtractionFailure>
//!                          (first format that yields a context wins)
//!
//! TraceContext ──▶ CompositePropagator::inject ──▶ outbound headers
//!                          (every configured format is written)
//! ```
//!
//! # Design Decisions
//! - Extraction never fails a request; `extract_or_new` maps any failure to a fresh trace
//! - Only ASCII hex rides on the wire
//! - Formats are selected by configuration, sender and receiver must share one

pub mod carrier;
pub mod error;
pub mod jaeger;
pub mod w3c;

use serde::{Deserialize, Serialize};

use crate::observability::context::TraceContext;

pub use carrier::{Extractor, Injector};
pub use error::ExtractionFailure;
pub use jaeger::{JaegerPropagator, UBER_TRACE_ID_HEADER};
pub use w3c::{TraceContextPropagator, TRACEPARENT_HEADER};

/// One wire format for trace context.
pub trait Propagator: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, carrier: &dyn Extractor) -> Result<TraceContext, ExtractionFailure>;

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector);
}

/// Wire formats selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationFormat {
    /// W3C `traceparent`.
    TraceContext,
    /// Jaeger `uber-trace-id`.
    Jaeger,
}

impl PropagationFormat {
    fn propagator(self) -> Box<dyn Propagator> {
        match self {
            PropagationFormat::TraceContext => Box::new(TraceContextPropagator),
            PropagationFormat::Jaeger => Box::new(JaegerPropagator),
        }
    }
}

/// Ordered set of propagators acting as one.
pub struct CompositePropagator {
    propagators: Vec<Box<dyn Propagator>>,
}

impl CompositePropagator {
    pub fn new(propagators: Vec<Box<dyn Propagator>>) -> Self {
        Self { propagators }
    }

    pub fn from_formats(formats: &[PropagationFormat]) -> Self {
        Self::new(formats.iter().map(|f| f.propagator()).collect())
    }

    /// Names of the configured formats, in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.propagators.iter().map(|p| p.name()).collect()
    }

    /// Extract with the first format that yields a context.
    ///
    /// When every format fails, a malformed header is reported in preference
    /// to a missing one.
    pub fn extract(&self, carrier: &dyn Extractor) -> Result<TraceContext, ExtractionFailure> {
        let mut failure = None;
        for propagator in &self.propagators {
            match propagator.extract(carrier) {
                Ok(context) => return Ok(context),
                Err(err) => {
                    if failure.as_ref().map_or(true, ExtractionFailure::is_missing) {
                        failure = Some(err);
                    }
                }
            }
        }
        Err(failure.unwrap_or(ExtractionFailure::Missing("trace context")))
    }

    /// The remote parent to continue, if the carrier has a usable one.
    /// A malformed header is logged and discarded.
    pub fn extract_remote(&self, carrier: &dyn Extractor) -> Option<TraceContext> {
        match self.extract(carrier) {
            Ok(context) => Some(context),
            Err(failure) => {
                if !failure.is_missing() {
                    tracing::debug!(error = %failure, "Discarding inbound trace context");
                }
                None
            }
        }
    }

    /// Extract, or start a new trace when the carrier has no usable context.
    pub fn extract_or_new(&self, carrier: &dyn Extractor) -> TraceContext {
        self.extract_remote(carrier)
            .unwrap_or_else(TraceContext::new_trace)
    }

    /// Write the context in every configured format.
    pub fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        for propagator in &self.propagators {
            propagator.inject(context, carrier);
        }
    }
}

impl Default for CompositePropagator {
    fn default() -> Self {
        Self::from_formats(&[PropagationFormat::TraceContext])
    }
}

impl std::fmt::Debug for CompositePropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositePropagator")
            .field("formats", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    fn both() -> CompositePropagator {
        CompositePropagator::from_formats(&[PropagationFormat::TraceContext, PropagationFormat::Jaeger])
    }

    #[test]
    fn test_inject_writes_every_format() {
        let ctx = TraceContext::new_trace();
        let mut headers = HeaderMap::new();
        both().inject(&ctx, &mut headers);

        assert!(headers.contains_key(TRACEPARENT_HEADER));
        assert!(headers.contains_key(UBER_TRACE_ID_HEADER));
        assert_eq!(TraceContextPropagator.extract(&headers).unwrap(), ctx);
        assert_eq!(JaegerPropagator.extract(&headers).unwrap(), ctx);
    }

    #[test]
    fn test_extract_falls_through_formats() {
        let ctx = TraceContext::new_trace();
        let mut headers = HeaderMap::new();
        JaegerPropagator.inject(&ctx, &mut headers);

        assert_eq!(both().extract(&headers).unwrap(), ctx);
    }

    #[test]
    fn test_extract_prefers_malformed_over_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static("00-bogus"));

        let err = both().extract(&headers).unwrap_err();
        assert_eq!(
            err,
            ExtractionFailure::malformed(TRACEPARENT_HEADER, "expected four dash-separated fields")
        );
    }

    #[test]
    fn test_extract_is_idempotent() {
        let ctx = TraceContext::new_trace();
        let mut headers = HeaderMap::new();
        both().inject(&ctx, &mut headers);

        let propagator = both();
        let first = propagator.extract(&headers).unwrap();
        let second = propagator.extract(&headers).unwrap();
        assert_eq!(first.trace_id(), second.trace_id());
    }

    #[test]
    fn test_extract_or_new_without_headers() {
        let ctx = both().extract_or_new(&HeaderMap::new());
        assert!(ctx.is_valid());
        assert!(ctx.is_sampled());
    }

    #[test]
    fn test_extract_or_new_with_malformed_header_starts_fresh() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACEPARENT_HEADER, HeaderValue::from_static("not-a-trace"));

        let ctx = CompositePropagator::default().extract_or_new(&headers);
        assert!(ctx.is_valid());
    }

    #[test]
    fn test_extract_or_new_keeps_remote_context() {
        let remote = TraceContext::new_trace();
        let mut headers = HeaderMap::new();
        CompositePropagator::default().inject(&remote, &mut headers);

        assert_eq!(CompositePropagator::default().extract_or_new(&headers), remote);
    }

    #[test]
    fn test_extract_remote_only_yields_usable_context() {
        let propagator = both();
        assert_eq!(propagator.extract_remote(&HeaderMap::new()), None);

        let mut malformed = HeaderMap::new();
        malformed.insert(TRACEPARENT_HEADER, HeaderValue::from_static("not-a-trace"));
        assert_eq!(propagator.extract_remote(&malformed), None);

        let remote = TraceContext::new_trace();
        let mut headers = HeaderMap::new();
        JaegerPropagator.inject(&remote, &mut headers);
        assert_eq!(propagator.extract_remote(&headers), Some(remote));
    }
}
