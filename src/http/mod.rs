//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, role routes, /metrics)
//!     → handler.rs (context resolution, workload, recording)
//!     → client.rs (edge only: call downstream with injected context)
//!     → Send to client
//! ```

pub mod client;
pub mod handler;
pub mod server;

pub use client::{DownstreamFailure, EdgeClient};
pub use handler::{HandlerResponse, ServiceHandler, ServiceTelemetry, Stage, TRACE_ID_HEADER};
pub use server::{AppState, ServerError, ServiceServer};
