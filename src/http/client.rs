//! Outbound call from the edge service to the downstream service.
//!
//! # Responsibilities
//! - Inject the active trace context into request headers
//! - Bound the call with a connect timeout and a total timeout
//! - Classify every failure as a [`DownstreamFailure`]
//!
//! # Design Decisions
//! - Single attempt per request, no retries
//! - Non-2xx answers are failures; their bodies are not forwarded

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, uri::InvalidUri, Method, Request, StatusCode, Uri},
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use thiserror::Error;

use crate::observability::{CompositePropagator, TraceContext};

/// Largest downstream body the edge will buffer.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Why the downstream call produced no usable body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownstreamFailure {
    #[error("could not connect to downstream: {0}")]
    Connect(String),

    #[error("downstream did not answer within {0:?}")]
    Timeout(Duration),

    #[error("downstream answered with status {0}")]
    Status(StatusCode),

    #[error("failed to read downstream body: {0}")]
    Body(String),

    #[error("downstream request failed: {0}")]
    Request(String),
}

impl DownstreamFailure {
    /// Short tag for logs and span attributes.
    pub const fn kind(&self) -> &'static str {
        match self {
            DownstreamFailure::Connect(_) => "connect",
            DownstreamFailure::Timeout(_) => "timeout",
            DownstreamFailure::Status(_) => "status",
            DownstreamFailure::Body(_) => "body",
            DownstreamFailure::Request(_) => "request",
        }
    }
}

/// HTTP client for the downstream endpoint.
#[derive(Clone)]
pub struct EdgeClient {
    client: Client<HttpConnector, Body>,
    uri: Uri,
    timeout: Duration,
    propagator: Arc<CompositePropagator>,
}

impl EdgeClient {
    pub fn new(
        url: &str,
        timeout: Duration,
        connect_timeout: Duration,
        propagator: Arc<CompositePropagator>,
    ) -> Result<Self, InvalidUri> {
        let uri: Uri = url.parse()?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            client,
            uri,
            timeout,
            propagator,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// `GET` the downstream endpoint carrying `context`, returning its body.
    pub async fn call(&self, context: &TraceContext) -> Result<String, DownstreamFailure> {
        match tokio::time::timeout(self.timeout, self.send(context)).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamFailure::Timeout(self.timeout)),
        }
    }

    async fn send(&self, context: &TraceContext) -> Result<String, DownstreamFailure> {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(self.uri.clone())
            .header(header::ACCEPT, "text/plain")
            .body(Body::empty())
            .map_err(|e| DownstreamFailure::Request(e.to_string()))?;
        self.propagator.inject(context, request.headers_mut());

        tracing::debug!(
            trace_id = %context.trace_id(),
            span_id = %context.span_id(),
            uri = %self.uri,
            "Calling downstream"
        );

        let response = self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                DownstreamFailure::Connect(e.to_string())
            } else {
                DownstreamFailure::Request(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownstreamFailure::Status(status));
        }

        let bytes = axum::body::to_bytes(Body::new(response.into_body()), MAX_BODY_BYTES)
            .await
            .map_err(|e| DownstreamFailure::Body(e.to_string()))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DownstreamFailure::Body("body is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for EdgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeClient")
            .field("uri", &self.uri)
            .field("timeout", &self.timeout)
            .finish()
    }
}
