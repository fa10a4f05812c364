//! Jaeger (`uber-trace-id`).
//!
//! ```text
//! uber-trace-id: {trace-id}:{span-id}:{parent-span-id}:{flags}
//! ```
//!
//! Ids are variable-length hex without padding. The parent field is
//! deprecated and ignored on extraction. Clients that URL-encode the header
//! send `%3A` for the separators.

use crate::observability::context::{SpanId, TraceContext, TraceId};
use crate::observability::propagation::{
    carrier::{Extractor, Injector},
    error::ExtractionFailure,
    Propagator,
};

pub const UBER_TRACE_ID_HEADER: &str = "uber-trace-id";

const FLAG_SAMPLED: u8 = 0x01;

/// Propagator for the `uber-trace-id` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct JaegerPropagator;

impl Propagator for JaegerPropagator {
    fn name(&self) -> &'static str {
        "jaeger"
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<TraceContext, ExtractionFailure> {
        let header = carrier
            .get(UBER_TRACE_ID_HEADER)
            .ok_or(ExtractionFailure::Missing(UBER_TRACE_ID_HEADER))?;
        parse_uber_trace_id(header.trim())
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        let flags = if context.is_sampled() { FLAG_SAMPLED } else { 0 };
        carrier.set(
            UBER_TRACE_ID_HEADER,
            format!(
                "{:x}:{:x}:0:{:x}",
                context.trace_id().to_u128(),
                context.span_id().to_u64(),
                flags
            ),
        );
    }
}

fn parse_uber_trace_id(value: &str) -> Result<TraceContext, ExtractionFailure> {
    let malformed = |reason| ExtractionFailure::malformed(UBER_TRACE_ID_HEADER, reason);

    let decoded = value.replace("%3A", ":").replace("%3a", ":");
    let parts: Vec<&str> = decoded.split(':').collect();
    if parts.len() != 4 {
        return Err(malformed("expected four colon-separated fields"));
    }

    let trace_id = TraceId::from_hex(parts[0]).ok_or(malformed("trace id is not 1-32 hex digits"))?;
    if !trace_id.is_valid() {
        return Err(malformed("trace id is zero"));
    }

    let span_id = SpanId::from_hex(parts[1]).ok_or(malformed("span id is not 1-16 hex digits"))?;
    if !span_id.is_valid() {
        return Err(malformed("span id is zero"));
    }

    if SpanId::from_hex(parts[2]).is_none() {
        return Err(malformed("parent span id is not hex"));
    }

    let flags = u8::from_str_radix(parts[3], 16).map_err(|_| malformed("flags are not hex"))?;

    Ok(TraceContext::from_parts(
        trace_id,
        span_id,
        flags & FLAG_SAMPLED == FLAG_SAMPLED,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn carrier(value: &str) -> HashMap<String, String> {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set(UBER_TRACE_ID_HEADER, value.to_string());
        carrier
    }

    #[test]
    fn test_extract_short_ids() {
        let ctx = JaegerPropagator.extract(&carrier("abc:def:0:1")).unwrap();
        assert_eq!(ctx.trace_id(), TraceId::from_u128(0xabc));
        assert_eq!(ctx.span_id(), SpanId::from_u64(0xdef));
        assert!(ctx.is_sampled());
    }

    #[test]
    fn test_extract_url_encoded() {
        let ctx = JaegerPropagator
            .extract(&carrier("4bf92f3577b34da6a3ce929d0e0e4736%3A00f067aa0ba902b7%3A0%3A0"))
            .unwrap();
        assert_eq!(ctx.trace_id().to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert!(!ctx.is_sampled());
    }

    #[test]
    fn test_extract_malformed() {
        for case in ["abc:def:0", "0:def:0:1", "abc:0:0:1", "abc:def:xyz:1", "abc:def:0:zz"] {
            let err = JaegerPropagator.extract(&carrier(case)).unwrap_err();
            assert!(!err.is_missing(), "{case} should be malformed, got {err}");
        }
    }

    #[test]
    fn test_inject_round_trips() {
        let ctx = TraceContext::new_trace();
        let mut headers: HashMap<String, String> = HashMap::new();
        JaegerPropagator.inject(&ctx, &mut headers);

        assert!(headers[UBER_TRACE_ID_HEADER].ends_with(":0:1"));
        assert_eq!(JaegerPropagator.extract(&headers).unwrap(), ctx);
    }
}
