//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum Router for the configured role
//! - Wire up middleware (tracing, request timeout)
//! - Serve `/metrics` on the main listener and, optionally, a dedicated one
//! - Bind server to listener and shut down on the broadcast signal
//! - Flush telemetry exporters once serving has stopped

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, uri::InvalidUri, Request},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::{Role, ServiceConfig};
use crate::http::client::EdgeClient;
use crate::http::handler::{HandlerResponse, ServiceHandler, ServiceTelemetry, TelemetryError};
use crate::observability::MetricsRegistry;
use crate::workload::{SimulatedWorkload, Workload};

pub const METRICS_ROUTE: &str = "/metrics";

/// Prometheus text exposition content type.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("edge role requires downstream.url")]
    MissingDownstream,

    #[error("invalid downstream url: {0}")]
    InvalidDownstream(#[from] InvalidUri),

    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<ServiceHandler>,
    pub registry: MetricsRegistry,
}

/// HTTP server for one service role.
pub struct ServiceServer {
    router: Router,
    config: ServiceConfig,
    state: AppState,
}

impl ServiceServer {
    /// Create a server with telemetry built from `config` and the simulated
    /// workload. Must be called inside a Tokio runtime.
    pub fn new(config: ServiceConfig) -> Result<Self, ServerError> {
        let workload = Arc::new(SimulatedWorkload::from_config(&config.workload));
        Self::with_workload(config, workload)
    }

    /// Like [`ServiceServer::new`] with a caller-supplied workload.
    pub fn with_workload(config: ServiceConfig, workload: Arc<dyn Workload>) -> Result<Self, ServerError> {
        let telemetry = ServiceTelemetry::from_config(&config)?;
        Self::from_parts(config, telemetry, workload)
    }

    /// Assemble from already-built telemetry.
    pub fn from_parts(
        config: ServiceConfig,
        telemetry: ServiceTelemetry,
        workload: Arc<dyn Workload>,
    ) -> Result<Self, ServerError> {
        let handler = match config.role() {
            Role::Edge => {
                let url = config
                    .downstream
                    .url
                    .as_deref()
                    .ok_or(ServerError::MissingDownstream)?;
                let client = EdgeClient::new(
                    url,
                    Duration::from_millis(config.downstream.timeout_ms),
                    Duration::from_millis(config.downstream.connect_timeout_ms),
                    telemetry.propagator.clone(),
                )?;
                ServiceHandler::edge(telemetry, workload, client)
            }
            Role::Downstream => ServiceHandler::downstream(telemetry, workload),
        };

        let state = AppState {
            registry: handler.telemetry().registry().clone(),
            handler: Arc::new(handler),
        };
        let router = Self::build_router(&config, state.clone());

        Ok(Self {
            router,
            config,
            state,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServiceConfig, state: AppState) -> Router {
        Router::new()
            .route(state.handler.route(), get(service_handler))
            .route(METRICS_ROUTE, get(metrics_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn metrics_router(state: AppState) -> Router {
        Router::new()
            .route(METRICS_ROUTE, get(metrics_handler))
            .with_state(state)
    }

    /// Router clone, for driving requests without a listener.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn telemetry(&self) -> &ServiceTelemetry {
        self.state.handler.telemetry()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Serve on `listener` until `shutdown` fires, then drain in-flight
    /// requests and flush telemetry.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            service = %self.config.service.name,
            role = ?self.config.role(),
            route = self.state.handler.route(),
            "HTTP server starting"
        );

        let metrics_task = match &self.config.telemetry.metrics_address {
            Some(address) => {
                let metrics_listener = TcpListener::bind(address).await?;
                let metrics_addr = metrics_listener.local_addr()?;
                tracing::info!(address = %metrics_addr, "Metrics listener starting");

                let router = Self::metrics_router(self.state.clone());
                let mut metrics_shutdown = shutdown.resubscribe();
                Some(tokio::spawn(async move {
                    axum::serve(metrics_listener, router)
                        .with_graceful_shutdown(async move {
                            let _ = metrics_shutdown.recv().await;
                        })
                        .await
                }))
            }
            None => None,
        };

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        if let Some(task) = metrics_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Metrics listener failed"),
                Err(e) => tracing::warn!(error = %e, "Metrics listener task panicked"),
            }
        }

        self.state.handler.telemetry().flush().await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Role handler. Reads the peer address when the router was served with
/// connect info, and does without it otherwise.
async fn service_handler(State(state): State<AppState>, request: Request<Body>) -> HandlerResponse {
    let (parts, _body) = request.into_parts();
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    state.handler.handle(&parts.headers, peer).await
}

/// Prometheus scrape endpoint.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        state.registry.export(),
    )
}
