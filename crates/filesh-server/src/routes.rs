//! HTTP API: batches, chunk upload/download and health
//!
//! ```text
//! POST /api/batch                          -> BatchMetadata
//! GET  /api/batch/{batchId}                -> {success, data: BatchInfo}
//! GET  /api/batch/{batchId}/chunks         -> {success, data: BatchChunks}
//! POST /api/upload/{batchId}/{chunkIndex}  multipart field `chunk`
//! HEAD /api/upload/{batchId}/{chunkIndex}  200 / 404
//! GET  /api/download/{batchId}/{chunkIndex} raw bytes / 404
//! HEAD /api/download/{batchId}/{chunkIndex} 200 / 404
//! GET  /api/health
//! GET  /metrics                            (when enabled)
//! ```

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use filesh_core::config::ServerConfig;
use filesh_core::types::{
    parse_chunk_index, ApiResponse, BatchChunks, BatchInfo, BatchMetadata, ChunkUploadResponse,
    HealthResponse,
};
use filesh_core::FileshError;
use filesh_storage::{BatchService, ChunkService, ObjectStore};
use std::time::Instant;

use crate::error::{ApiError, ApiResult};
use crate::metrics::{metrics_handler, ServerMetrics};

#[derive(Clone)]
pub struct AppState {
    pub store: ObjectStore,
    pub batches: BatchService,
    pub chunks: ChunkService,
    pub metrics: ServerMetrics,
}

impl AppState {
    pub fn new(store: ObjectStore, metrics: ServerMetrics) -> Self {
        Self {
            batches: BatchService::new(store.clone()),
            chunks: ChunkService::new(store.clone()),
            store,
            metrics,
        }
    }
}

pub fn router(state: AppState, cfg: &ServerConfig) -> Router {
    let mut app = Router::new()
        .route("/api/health", get(health))
        .route("/api/batch", post(create_batch))
        .route("/api/batch/{batch_id}", get(batch_info))
        .route("/api/batch/{batch_id}/chunks", get(list_chunks))
        .route(
            "/api/upload/{batch_id}/{chunk_index}",
            post(upload_chunk).head(check_chunk),
        )
        .route(
            "/api/download/{batch_id}/{chunk_index}",
            get(download_chunk).head(check_chunk),
        )
        .layer(DefaultBodyLimit::max(cfg.max_chunk_bytes));

    if cfg.metrics {
        app = app.route("/metrics", get(metrics_handler));
    }

    app.layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// One log line and one metric sample per `/api` request
async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    if path.starts_with("/api") {
        let latency = started.elapsed();
        let status = response.status().as_u16();
        tracing::info!(
            method = %method,
            path = %path,
            status,
            latency_ms = latency.as_millis() as u64,
            "api request"
        );
        state
            .metrics
            .observe_request(method.as_str(), status, latency.as_secs_f64());
    }
    response
}

/// 503 with status "degraded" while the chunk store cannot be listed
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match state.store.check_health().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    let body = HealthResponse {
        status: status.into(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    (code, Json(body))
}

async fn create_batch(State(state): State<AppState>) -> Json<BatchMetadata> {
    Json(state.batches.create_batch())
}

async fn batch_info(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<ApiResponse<BatchInfo>>> {
    let info = state.batches.batch_info(&batch_id).await?;
    Ok(Json(ApiResponse::ok(info)))
}

async fn list_chunks(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> ApiResult<Json<ApiResponse<BatchChunks>>> {
    let chunks = state.batches.list_chunks(&batch_id).await?;
    Ok(Json(ApiResponse::ok(chunks)))
}

async fn upload_chunk(
    State(state): State<AppState>,
    Path((batch_id, raw_index)): Path<(String, String)>,
    mut multipart: Multipart,
) -> ApiResult<Json<ChunkUploadResponse>> {
    let chunk_index = parse_chunk_index(&raw_index)?;
    let data = read_chunk_field(&mut multipart).await?;

    let ack = state
        .chunks
        .upload_chunk(&batch_id, chunk_index, data)
        .await
        .inspect_err(|_| state.metrics.chunk_failed("upload"))?;
    state.metrics.chunk_uploaded(ack.size);
    Ok(Json(ack))
}

async fn read_chunk_field(multipart: &mut Multipart) -> ApiResult<Bytes> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("chunk") {
            return Ok(field.bytes().await?);
        }
    }
    Err(ApiError::bad_request("no chunk uploaded (expected multipart field `chunk`)"))
}

async fn check_chunk(
    State(state): State<AppState>,
    Path((batch_id, raw_index)): Path<(String, String)>,
) -> ApiResult<Response> {
    let chunk_index = parse_chunk_index(&raw_index)?;
    let status = state.chunks.check_chunk(&batch_id, chunk_index).await?;
    if !status.exists {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(status.size));
    if let Some(etag) = status.etag {
        let quoted = if etag.starts_with('"') {
            etag
        } else {
            format!("\"{etag}\"")
        };
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Some(uploaded) = status.uploaded {
        let date = uploaded.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&date) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
    Ok((StatusCode::OK, headers).into_response())
}

async fn download_chunk(
    State(state): State<AppState>,
    Path((batch_id, raw_index)): Path<(String, String)>,
) -> ApiResult<Response> {
    let chunk_index = parse_chunk_index(&raw_index)?;
    let data = state
        .chunks
        .download_chunk(&batch_id, chunk_index)
        .await
        .inspect_err(|e| {
            if !matches!(e, FileshError::NotFound(_)) {
                state.metrics.chunk_failed("download");
            }
        })?;
    state.metrics.chunk_downloaded(data.len() as u64);

    let disposition = format!("attachment; filename=\"{batch_id}_{chunk_index}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        data,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use filesh_storage::{memory_operator, RetryPolicy};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "filesh-test-boundary";

    fn app_with(cfg: ServerConfig) -> Router {
        let store = ObjectStore::new(memory_operator().unwrap(), RetryPolicy::default());
        router(AppState::new(store, ServerMetrics::new()), &cfg)
    }

    fn app() -> Router {
        app_with(ServerConfig::default())
    }

    fn multipart(uri: &str, field: &str, data: &[u8]) -> Request {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"chunk\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn bare(method: &str, uri: &str) -> Request {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, req: Request) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    fn json(body: &[u8]) -> Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (status, body) = send(&app(), bare("GET", "/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn create_batch_returns_id_and_expiry() {
        let (status, body) = send(&app(), bare("POST", "/api/batch")).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert!(body["id"].as_str().is_some_and(|id| !id.is_empty()));
        assert!(body["createdAt"].is_string());
        assert!(body["expiresAt"].is_string());
    }

    #[tokio::test]
    async fn chunk_lifecycle() {
        let app = app();

        let (status, body) = send(&app, multipart("/api/upload/b1/1", "chunk", b"0123456789")).await;
        assert_eq!(status, StatusCode::OK);
        let ack = json(&body);
        assert_eq!(ack["success"], true);
        assert_eq!(ack["size"], 10);
        assert_eq!(ack["chunkIndex"], 1);

        send(&app, multipart("/api/upload/b1/0", "chunk", b"abc")).await;

        for uri in ["/api/upload/b1/1", "/api/download/b1/1"] {
            let (status, _) = send(&app, bare("HEAD", uri)).await;
            assert_eq!(status, StatusCode::OK, "HEAD {uri}");
        }

        let response = app.clone().oneshot(bare("GET", "/api/download/b1/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let data = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&data[..], b"0123456789");

        let (status, body) = send(&app, bare("GET", "/api/batch/b1/chunks")).await;
        assert_eq!(status, StatusCode::OK);
        let listing = json(&body);
        assert_eq!(listing["success"], true);
        assert_eq!(listing["data"]["totalSize"], 13);
        let indices: Vec<u64> = listing["data"]["chunks"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1]);

        let (status, body) = send(&app, bare("GET", "/api/batch/b1")).await;
        assert_eq!(status, StatusCode::OK);
        let info = json(&body);
        assert_eq!(info["data"]["chunksCount"], 2);
        assert_eq!(info["data"]["totalSize"], 13);
    }

    #[tokio::test]
    async fn missing_chunk_is_404() {
        let app = app();
        let (status, body) = send(&app, bare("GET", "/api/download/b1/7")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["success"], false);

        let (status, _) = send(&app, bare("HEAD", "/api/download/b1/7")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_batch_is_404_envelope() {
        let (status, body) = send(&app(), bare("GET", "/api/batch/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body = json(&body);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn bad_uploads_are_400() {
        let app = app();
        let cases = [
            multipart("/api/upload/b1/0", "chunk", b""),
            multipart("/api/upload/b1/0", "file", b"data"),
            multipart("/api/upload/b1/-1", "chunk", b"data"),
            multipart("/api/upload/b1/abc", "chunk", b"data"),
        ];
        for req in cases {
            let uri = req.uri().to_string();
            let (status, body) = send(&app, req).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(json(&body)["success"], false);
        }
    }

    #[tokio::test]
    async fn oversized_chunk_is_413() {
        let app = app_with(ServerConfig {
            max_chunk_bytes: 1024,
            ..Default::default()
        });
        let (status, _) = send(&app, multipart("/api/upload/b1/0", "chunk", &[7u8; 4096])).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn metrics_count_chunks() {
        let app = app();
        send(&app, multipart("/api/upload/b1/0", "chunk", b"abcd")).await;
        send(&app, bare("GET", "/api/download/b1/0")).await;

        let (status, body) = send(&app, bare("GET", "/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("filesh_chunks_uploaded_total 1"));
        assert!(text.contains("filesh_chunk_bytes_downloaded_total 4"));
        assert!(text.contains("method=\"POST\""));
    }

    #[tokio::test]
    async fn metrics_route_can_be_disabled() {
        let app = app_with(ServerConfig {
            metrics: false,
            ..Default::default()
        });
        let (status, _) = send(&app, bare("GET", "/metrics")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
