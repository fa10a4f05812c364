//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use looking_glass::config::{ExportConfig, Role, ServiceConfig};
use looking_glass::http::{ServiceServer, ServiceTelemetry};
use looking_glass::lifecycle::Shutdown;
use looking_glass::observability::export::{Exporter, MemorySink};
use looking_glass::observability::{
    CompositePropagator, LogRecord, MetricsRegistry, PropagationFormat, ServiceMetrics,
    StructuredLogger, Tracer,
};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
use looking_glass::workload::Workload;

/// Headers of one request seen by a capturing backend, keys lowercased.
/// The request line is kept under `:method` and `:path`.
pub type CapturedHeaders = HashMap<String, String>;

/// An address nothing listens on.
pub fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Read one request head and return its request line and headers.
async fn read_request_head(socket: &mut TcpStream) -> CapturedHeaders {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let mut captured = CapturedHeaders::new();
    if let Some(request_line) = lines.next() {
        let mut parts = request_line.split_whitespace();
        if let (Some(method), Some(path)) = (parts.next(), parts.next()) {
            captured.insert(":method".to_string(), method.to_string());
            captured.insert(":path".to_string(), path.to_string());
        }
    }
    captured.extend(
        lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string())),
    );
    captured
}

async fn write_response(socket: &mut TcpStream, status: u16, body: &str) {
    let status_text = match status {
        200 => "200 OK",
        404 => "404 Not Found",
        500 => "500 Internal Server Error",
        502 => "502 Bad Gateway",
        503 => "503 Service Unavailable",
        _ => "200 OK",
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_text,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Start a programmable mock backend on an ephemeral port. The closure sees
/// the request headers and picks status and body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(CapturedHeaders) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let headers = read_request_head(&mut socket).await;
                        let (status, body) = f(headers).await;
                        write_response(&mut socket, status, &body).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Backend that answers `body` and records every request's headers.
pub async fn start_capturing_backend(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<CapturedHeaders>>>) {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let addr = start_programmable_backend(move |headers| {
        sink.lock().unwrap().push(headers);
        async move { (200, body.to_string()) }
    })
    .await;
    (addr, captured)
}

/// Backend that waits `delay` before answering.
pub async fn start_slow_backend(delay: Duration, body: &'static str) -> SocketAddr {
    start_programmable_backend(move |_| async move {
        tokio::time::sleep(delay).await;
        (200, body.to_string())
    })
    .await
}

/// Role defaults on loopback with an ephemeral port.
pub fn test_config(role: Role) -> ServiceConfig {
    let mut config = ServiceConfig::for_role(role);
    config.listener.host = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.downstream.timeout_ms = 2_000;
    config.downstream.connect_timeout_ms = 500;
    config
}

/// Telemetry recording into memory sinks.
pub struct MemoryTelemetry {
    pub telemetry: ServiceTelemetry,
    pub logs: MemorySink<LogRecord>,
    pub spans: InMemorySpanExporter,
}

impl MemoryTelemetry {
    pub fn new(name: &str, formats: &[PropagationFormat]) -> Self {
        let logs = MemorySink::new();
        let spans = InMemorySpanExporter::default();
        let export = ExportConfig::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(spans.clone())
            .build();
        let telemetry = ServiceTelemetry::new(
            ServiceMetrics::new(MetricsRegistry::new().unwrap(), name, true),
            StructuredLogger::new(name, Some(Exporter::spawn(logs.clone(), &export))),
            Tracer::new(name, provider),
            Arc::new(CompositePropagator::from_formats(formats)),
        );
        Self {
            telemetry,
            logs,
            spans,
        }
    }

    /// Spans finished so far, in end order.
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.get_finished_spans().unwrap()
    }
}

/// A service serving on loopback until dropped or shut down.
pub struct RunningService {
    pub addr: SocketAddr,
    pub telemetry: ServiceTelemetry,
    pub shutdown: Shutdown,
}

impl RunningService {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn registry(&self) -> &MetricsRegistry {
        self.telemetry.registry()
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Serve an already-assembled server on an ephemeral loopback port.
pub async fn serve(server: ServiceServer) -> RunningService {
    let telemetry = server.telemetry().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    RunningService {
        addr,
        telemetry,
        shutdown,
    }
}

/// Build and serve a service with the given telemetry and workload.
pub async fn spawn_service(
    config: ServiceConfig,
    telemetry: ServiceTelemetry,
    workload: Arc<dyn Workload>,
) -> RunningService {
    let server = ServiceServer::from_parts(config, telemetry, workload).unwrap();
    serve(server).await
}

/// Client without connection reuse or proxies.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
