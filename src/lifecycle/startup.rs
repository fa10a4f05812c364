//! Startup orchestration.
//!
//! # Responsibilities
//! - Initialize telemetry (registry, sinks, propagator) from configuration
//! - Bind the listener and begin accepting traffic
//! - Wire OS signals to the shutdown coordinator
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - The listener binds last, once the server is fully assembled

use tokio::net::TcpListener;

use crate::config::ServiceConfig;
use crate::http::{ServerError, ServiceServer};
use crate::lifecycle::{signals, Shutdown};

/// Run a service until SIGINT or SIGTERM.
pub async fn run(config: ServiceConfig) -> Result<(), ServerError> {
    let bind_address = config.listener.bind_address();
    tracing::info!(
        service = %config.service.name,
        role = ?config.role(),
        bind_address = %bind_address,
        downstream = config.downstream.url.as_deref().unwrap_or("-"),
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let server = ServiceServer::new(config)?;
    let listener = TcpListener::bind(&bind_address).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, "Listening for connections");

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(shutdown.trigger_on(signals::shutdown_signal()));

    server.run(listener, server_shutdown).await
}
