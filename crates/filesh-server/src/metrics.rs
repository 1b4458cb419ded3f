//! Prometheus metrics for the chunk API
//!
//! Exposed on `GET /metrics` in the text exposition format.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use std::sync::Arc;

use crate::routes::AppState;

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct ServerMetrics {
    registry: Arc<Registry>,
    requests: Family<Labels, Counter>,
    request_duration: Family<Labels, Histogram>,
    chunks_uploaded: Counter,
    chunks_downloaded: Counter,
    bytes_uploaded: Counter,
    bytes_downloaded: Counter,
    chunk_failures: Family<Labels, Counter>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests = Family::<Labels, Counter>::default();
        let request_duration = Family::<Labels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0])
        });
        let chunks_uploaded = Counter::default();
        let chunks_downloaded = Counter::default();
        let bytes_uploaded = Counter::default();
        let bytes_downloaded = Counter::default();
        let chunk_failures = Family::<Labels, Counter>::default();

        registry.register(
            "filesh_http_requests",
            "API requests by method and status",
            requests.clone(),
        );
        registry.register(
            "filesh_http_request_duration_seconds",
            "API request latency in seconds",
            request_duration.clone(),
        );
        registry.register(
            "filesh_chunks_uploaded",
            "Chunks stored",
            chunks_uploaded.clone(),
        );
        registry.register(
            "filesh_chunks_downloaded",
            "Chunks served",
            chunks_downloaded.clone(),
        );
        registry.register(
            "filesh_chunk_bytes_uploaded",
            "Ciphertext bytes stored",
            bytes_uploaded.clone(),
        );
        registry.register(
            "filesh_chunk_bytes_downloaded",
            "Ciphertext bytes served",
            bytes_downloaded.clone(),
        );
        registry.register(
            "filesh_chunk_failures",
            "Failed chunk operations by operation",
            chunk_failures.clone(),
        );

        Self {
            registry: Arc::new(registry),
            requests,
            request_duration,
            chunks_uploaded,
            chunks_downloaded,
            bytes_uploaded,
            bytes_downloaded,
            chunk_failures,
        }
    }

    pub fn observe_request(&self, method: &str, status: u16, seconds: f64) {
        self.requests
            .get_or_create(&vec![
                ("method".to_string(), method.to_string()),
                ("status".to_string(), status.to_string()),
            ])
            .inc();
        self.request_duration
            .get_or_create(&vec![("method".to_string(), method.to_string())])
            .observe(seconds);
    }

    pub fn chunk_uploaded(&self, bytes: u64) {
        self.chunks_uploaded.inc();
        self.bytes_uploaded.inc_by(bytes);
    }

    pub fn chunk_downloaded(&self, bytes: u64) {
        self.chunks_downloaded.inc();
        self.bytes_downloaded.inc_by(bytes);
    }

    pub fn chunk_failed(&self, operation: &str) {
        self.chunk_failures
            .get_or_create(&vec![("operation".to_string(), operation.to_string())])
            .inc();
    }

    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}
