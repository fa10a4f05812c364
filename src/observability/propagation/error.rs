//! Extraction failures.
//!
//! A failure never rejects a request: the caller starts a fresh trace
//! instead. The variants only decide how loudly that is logged.

use thiserror::Error;

/// Why a carrier did not yield a trace context.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFailure {
    /// The propagation header is absent. Normal for the first hop.
    #[error("no {0} header present")]
    Missing(&'static str),

    /// The header is present but cannot be decoded.
    #[error("malformed {header} header: {reason}")]
    Malformed {
        header: &'static str,
        reason: &'static str,
    },
}

impl ExtractionFailure {
    pub const fn malformed(header: &'static str, reason: &'static str) -> Self {
        Self::Malformed { header, reason }
    }

    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}
