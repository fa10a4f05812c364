//! W3C Trace Context (`traceparent`).
//!
//! ```text
//! traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//!              │  │                                │                └ flags (bit 0 = sampled)
//!              │  │                                └ parent span id (16 hex)
//!              │  └ trace id (32 hex)
//!              └ version
//! ```

use crate::observability::context::{SpanId, TraceContext, TraceId};
use crate::observability::propagation::{
    carrier::{Extractor, Injector},
    error::ExtractionFailure,
    Propagator,
};

pub const TRACEPARENT_HEADER: &str = "traceparent";

const SUPPORTED_VERSION: &str = "00";
const INVALID_VERSION: &str = "ff";
const FLAG_SAMPLED: u8 = 0x01;

/// Propagator for the `traceparent` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn name(&self) -> &'static str {
        "tracecontext"
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<TraceContext, ExtractionFailure> {
        let header = carrier
            .get(TRACEPARENT_HEADER)
            .ok_or(ExtractionFailure::Missing(TRACEPARENT_HEADER))?;
        parse_traceparent(header.trim())
    }

    fn inject(&self, context: &TraceContext, carrier: &mut dyn Injector) {
        let flags = if context.is_sampled() { FLAG_SAMPLED } else { 0 };
        carrier.set(
            TRACEPARENT_HEADER,
            format!(
                "{}-{}-{}-{:02x}",
                SUPPORTED_VERSION,
                context.trace_id(),
                context.span_id(),
                flags
            ),
        );
    }
}

fn parse_traceparent(value: &str) -> Result<TraceContext, ExtractionFailure> {
    let malformed = |reason| ExtractionFailure::malformed(TRACEPARENT_HEADER, reason);

    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() < 4 {
        return Err(malformed("expected four dash-separated fields"));
    }

    let version = parts[0];
    if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed("invalid version"));
    }
    if version.eq_ignore_ascii_case(INVALID_VERSION) {
        return Err(malformed("version ff is forbidden"));
    }
    // Future versions may append fields; version 00 may not
    if version == SUPPORTED_VERSION && parts.len() != 4 {
        return Err(malformed("unexpected trailing fields"));
    }

    if parts[1].len() != 32 {
        return Err(malformed("trace id must be 32 hex digits"));
    }
    let trace_id = TraceId::from_hex(parts[1]).ok_or(malformed("trace id is not hex"))?;
    if !trace_id.is_valid() {
        return Err(malformed("trace id is all zeroes"));
    }

    if parts[2].len() != 16 {
        return Err(malformed("span id must be 16 hex digits"));
    }
    let span_id = SpanId::from_hex(parts[2]).ok_or(malformed("span id is not hex"))?;
    if !span_id.is_valid() {
        return Err(malformed("span id is all zeroes"));
    }

    if parts[3].len() != 2 {
        return Err(malformed("flags must be 2 hex digits"));
    }
    let flags = u8::from_str_radix(parts[3], 16).map_err(|_| malformed("flags are not hex"))?;

    Ok(TraceContext::from_parts(
        trace_id,
        span_id,
        flags & FLAG_SAMPLED == FLAG_SAMPLED,
    ))
}
