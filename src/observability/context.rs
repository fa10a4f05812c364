//! Trace context carried by every request.
//!
//! A [`TraceContext`] names one hop of one request: the 128-bit trace id is
//! shared by every hop of the request chain, the 64-bit span id is minted
//! fresh for each hop. Contexts are immutable; continuing a trace produces a
//! new value via [`TraceContext::child`].

use std::fmt;

use opentelemetry::trace::{self as otel, TraceFlags, TraceState};
use rand::Rng;

/// 128-bit trace identifier. Zero is reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    /// A random, non-zero identifier.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value: u128 = rng.gen();
            if value != 0 {
                return Self(value);
            }
        }
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn to_u128(self) -> u128 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parse up to 32 hex digits. Shorter values are treated as left-padded.
    pub fn from_hex(hex: &str) -> Option<Self> {
        parse_hex(hex, 32).map(Self)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 64-bit span identifier. Zero is reserved as invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    /// A random, non-zero identifier.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value: u64 = rng.gen();
            if value != 0 {
                return Self(value);
            }
        }
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Parse up to 16 hex digits. Shorter values are treated as left-padded.
    pub fn from_hex(hex: &str) -> Option<Self> {
        parse_hex(hex, 16).and_then(|v| u64::try_from(v).ok()).map(Self)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn parse_hex(hex: &str, max_digits: usize) -> Option<u128> {
    // from_str_radix alone would also accept a leading '+'
    if hex.is_empty() || hex.len() > max_digits || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u128::from_str_radix(hex, 16).ok()
}

/// The identity of one hop within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceContext {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
}

impl TraceContext {
    /// Start a new trace. Sampling is always on.
    pub fn new_trace() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            sampled: true,
        }
    }

    /// Rebuild a context received from a remote caller.
    pub const fn from_parts(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        Self {
            trace_id,
            span_id,
            sampled,
        }
    }

    /// Next hop of the same trace: same trace id and sampling decision,
    /// fresh span id.
    pub fn child(&self) -> Self {
        let mut span_id = SpanId::random();
        while span_id == self.span_id {
            span_id = SpanId::random();
        }
        Self {
            trace_id: self.trace_id,
            span_id,
            sampled: self.sampled,
        }
    }

    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub const fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub const fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    /// Span context handed to the span SDK. `remote` marks a context that
    /// arrived over the wire rather than one opened in this process.
    pub fn to_span_context(&self, remote: bool) -> otel::SpanContext {
        let flags = if self.sampled {
            TraceFlags::SAMPLED
        } else {
            TraceFlags::default()
        };
        otel::SpanContext::new(
            self.trace_id.into(),
            self.span_id.into(),
            flags,
            remote,
            TraceState::default(),
        )
    }

    pub fn from_span_context(context: &otel::SpanContext) -> Self {
        Self {
            trace_id: context.trace_id().into(),
            span_id: context.span_id().into(),
            sampled: context.is_sampled(),
        }
    }
}

impl From<TraceId> for otel::TraceId {
    fn from(id: TraceId) -> Self {
        otel::TraceId::from_bytes(id.0.to_be_bytes())
    }
}

impl From<otel::TraceId> for TraceId {
    fn from(id: otel::TraceId) -> Self {
        TraceId(u128::from_be_bytes(id.to_bytes()))
    }
}

impl From<SpanId> for otel::SpanId {
    fn from(id: SpanId) -> Self {
        otel::SpanId::from_bytes(id.0.to_be_bytes())
    }
}

impl From<otel::SpanId> for SpanId {
    fn from(id: otel::SpanId) -> Self {
        SpanId(u64::from_be_bytes(id.to_bytes()))
    }
}
