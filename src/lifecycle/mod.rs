//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config (validated by main) → Build telemetry → Bind listener → Serve
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Stop accepting → Drain in-flight requests → Flush exporters → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Telemetry is built before the listener, so no request goes unrecorded
//! - Exporters flush after the last request has been recorded

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
