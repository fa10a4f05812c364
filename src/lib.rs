//! Request-scoped observability correlation for a two-service chain.
//!
//! An edge service calls a downstream service; both resolve one trace
//! context per request and record a metric sample, a log record and a span
//! under the same trace id.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod workload;

pub use config::schema::ServiceConfig;
pub use http::ServiceServer;
pub use lifecycle::Shutdown;
