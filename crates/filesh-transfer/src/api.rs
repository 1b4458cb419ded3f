//! Batch/chunk API seen from the client
//!
//! [`BatchApi`] is what the upload and download state machines talk to.
//! [`HttpApi`] speaks to a `fileshd` server over HTTP; [`StorageApi`] goes
//! straight to an object store (no server in between), which is handy for
//! local setups and for tests.

use async_trait::async_trait;
use bytes::Bytes;
use filesh_core::types::{
    ApiResponse, BatchChunks, BatchInfo, BatchMetadata, ChunkUploadResponse,
};
use filesh_core::FileshError;
use filesh_storage::{BatchService, ChunkService, ObjectStore};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as HttpClient, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{TransferError, TransferResult};

const USER_AGENT: &str = concat!("filesh/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait BatchApi: Send + Sync {
    /// `POST /api/batch`
    async fn create_batch(&self) -> TransferResult<BatchMetadata>;

    /// `POST /api/upload/{batchId}/{chunkIndex}`, multipart field `chunk`
    async fn upload_chunk(
        &self,
        batch_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> TransferResult<ChunkUploadResponse>;

    /// `HEAD /api/download/{batchId}/{chunkIndex}`
    async fn chunk_exists(&self, batch_id: &str, chunk_index: u32) -> TransferResult<bool>;

    /// `GET /api/download/{batchId}/{chunkIndex}`; a missing chunk is
    /// [`TransferError::NotFound`].
    async fn download_chunk(&self, batch_id: &str, chunk_index: u32) -> TransferResult<Bytes>;

    /// `GET /api/batch/{batchId}`
    async fn batch_info(&self, batch_id: &str) -> TransferResult<BatchInfo>;

    /// `GET /api/batch/{batchId}/chunks`
    async fn list_chunks(&self, batch_id: &str) -> TransferResult<BatchChunks>;
}

/// HTTP client for the filesh server.
#[derive(Debug, Clone)]
pub struct HttpApi {
    /// Base endpoint of the server, always ending in `/`
    endpoint: Url,
    client: HttpClient,
}

impl HttpApi {
    pub fn new(api_url: &str) -> TransferResult<Self> {
        let mut endpoint = Url::parse(api_url)
            .map_err(|e| TransferError::Api(format!("invalid API URL '{api_url}': {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(transport)?;

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> TransferResult<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| TransferError::Api(format!("building URL for {path}: {e}")))
    }

    fn chunk_url(&self, kind: &str, batch_id: &str, chunk_index: u32) -> TransferResult<Url> {
        self.url(&format!("api/{kind}/{batch_id}/{chunk_index}"))
    }
}

#[async_trait]
impl BatchApi for HttpApi {
    async fn create_batch(&self) -> TransferResult<BatchMetadata> {
        let res = self
            .client
            .post(self.url("api/batch")?)
            .send()
            .await
            .map_err(transport)?;
        json(res).await
    }

    async fn upload_chunk(
        &self,
        batch_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> TransferResult<ChunkUploadResponse> {
        let len = data.len() as u64;
        let part = Part::stream_with_length(data, len).file_name(format!("chunk-{chunk_index}"));
        let form = Form::new().part("chunk", part);

        let res = self
            .client
            .post(self.chunk_url("upload", batch_id, chunk_index)?)
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;

        let ack: ChunkUploadResponse = json(res).await?;
        if !ack.success {
            return Err(TransferError::chunk(chunk_index, "server did not acknowledge chunk"));
        }
        Ok(ack)
    }

    async fn chunk_exists(&self, batch_id: &str, chunk_index: u32) -> TransferResult<bool> {
        let res = self
            .client
            .head(self.chunk_url("download", batch_id, chunk_index)?)
            .send()
            .await
            .map_err(transport)?;

        match res.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_from_response(res).await),
        }
    }

    async fn download_chunk(&self, batch_id: &str, chunk_index: u32) -> TransferResult<Bytes> {
        let res = self
            .client
            .get(self.chunk_url("download", batch_id, chunk_index)?)
            .send()
            .await
            .map_err(transport)?;

        if !res.status().is_success() {
            return Err(error_from_response(res).await);
        }
        res.bytes().await.map_err(transport)
    }

    async fn batch_info(&self, batch_id: &str) -> TransferResult<BatchInfo> {
        let res = self
            .client
            .get(self.url(&format!("api/batch/{batch_id}"))?)
            .send()
            .await
            .map_err(transport)?;
        enveloped(res).await
    }

    async fn list_chunks(&self, batch_id: &str) -> TransferResult<BatchChunks> {
        let res = self
            .client
            .get(self.url(&format!("api/batch/{batch_id}/chunks"))?)
            .send()
            .await
            .map_err(transport)?;
        enveloped(res).await
    }
}

fn transport(e: reqwest::Error) -> TransferError {
    TransferError::Api(e.to_string())
}

async fn json<T: DeserializeOwned>(res: Response) -> TransferResult<T> {
    if !res.status().is_success() {
        return Err(error_from_response(res).await);
    }
    res.json()
        .await
        .map_err(|e| TransferError::Api(format!("malformed response: {e}")))
}

async fn enveloped<T: DeserializeOwned>(res: Response) -> TransferResult<T> {
    let envelope: ApiResponse<T> = json(res).await?;
    match envelope {
        ApiResponse {
            success: true,
            data: Some(data),
            ..
        } => Ok(data),
        ApiResponse { error, .. } => Err(TransferError::Api(
            error.unwrap_or_else(|| "response carried no data".into()),
        )),
    }
}

/// Turn a non-2xx response into an error. 404 is `NotFound`, other 4xx
/// (except timeouts and throttling) are not worth retrying.
async fn error_from_response(res: Response) -> TransferError {
    let status = res.status();
    let url = res.url().path().to_string();
    let body = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
        .ok()
        .and_then(|r| r.error)
        .unwrap_or(body);

    match status {
        StatusCode::NOT_FOUND => TransferError::NotFound(url),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransferError::Api(format!("HTTP {status}: {message}"))
        }
        s if s.is_client_error() => TransferError::Rejected(format!("HTTP {status}: {message}")),
        _ => TransferError::Api(format!("HTTP {status}: {message}")),
    }
}

/// Direct access to an object store, bypassing the HTTP server.
#[derive(Debug, Clone)]
pub struct StorageApi {
    batches: BatchService,
    chunks: ChunkService,
}

impl StorageApi {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            batches: BatchService::new(store.clone()),
            chunks: ChunkService::new(store),
        }
    }
}

fn from_storage(e: FileshError) -> TransferError {
    match e {
        FileshError::NotFound(what) => TransferError::NotFound(what),
        FileshError::InvalidInput(what) => TransferError::Rejected(what),
        other => TransferError::Api(other.to_string()),
    }
}

#[async_trait]
impl BatchApi for StorageApi {
    async fn create_batch(&self) -> TransferResult<BatchMetadata> {
        Ok(self.batches.create_batch())
    }

    async fn upload_chunk(
        &self,
        batch_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> TransferResult<ChunkUploadResponse> {
        self.chunks
            .upload_chunk(batch_id, chunk_index, data)
            .await
            .map_err(from_storage)
    }

    async fn chunk_exists(&self, batch_id: &str, chunk_index: u32) -> TransferResult<bool> {
        self.chunks
            .check_chunk(batch_id, chunk_index)
            .await
            .map(|status| status.exists)
            .map_err(from_storage)
    }

    async fn download_chunk(&self, batch_id: &str, chunk_index: u32) -> TransferResult<Bytes> {
        self.chunks
            .download_chunk(batch_id, chunk_index)
            .await
            .map_err(from_storage)
    }

    async fn batch_info(&self, batch_id: &str) -> TransferResult<BatchInfo> {
        self.batches.batch_info(batch_id).await.map_err(from_storage)
    }

    async fn list_chunks(&self, batch_id: &str) -> TransferResult<BatchChunks> {
        self.batches.list_chunks(batch_id).await.map_err(from_storage)
    }
}
