//! Chunk upload / existence check / download

use bytes::Bytes;
use chrono::Utc;
use filesh_core::types::{chunk_key, validate_batch_id, ChunkStatus, ChunkUploadResponse};
use filesh_core::{FileshError, FileshResult};
use std::time::Instant;

use crate::store::ObjectStore;

#[derive(Debug, Clone)]
pub struct ChunkService {
    store: ObjectStore,
}

impl ChunkService {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Store one chunk under `{batchId}/{chunkIndex}`. Re-uploading an index
    /// overwrites it.
    pub async fn upload_chunk(
        &self,
        batch_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> FileshResult<ChunkUploadResponse> {
        validate_batch_id(batch_id)?;
        if data.is_empty() {
            return Err(FileshError::InvalidInput("chunk is empty".into()));
        }

        let key = chunk_key(batch_id, chunk_index);
        let size = data.len() as u64;
        tracing::debug!(batch_id, chunk_index, bytes = size, "uploading chunk");

        let started = Instant::now();
        self.store.put(&key, data).await?;
        let upload_time_ms = started.elapsed().as_millis() as u64;

        let mut response = ChunkUploadResponse {
            success: true,
            batch_id: batch_id.to_string(),
            chunk_index,
            size,
            etag: None,
            uploaded: None,
            upload_time_ms: Some(upload_time_ms),
        };

        match self.store.stat(&key).await {
            Ok(info) => {
                if info.size != size {
                    tracing::warn!(
                        batch_id,
                        chunk_index,
                        expected = size,
                        stored = info.size,
                        "stored chunk size mismatch"
                    );
                }
                response.size = info.size;
                response.etag = info.etag;
                response.uploaded = Some(info.last_modified.unwrap_or_else(Utc::now));
            }
            Err(e) => {
                tracing::warn!(batch_id, chunk_index, error = %e, "could not stat uploaded chunk");
            }
        }

        tracing::info!(batch_id, chunk_index, bytes = response.size, upload_time_ms, "chunk stored");
        Ok(response)
    }

    pub async fn check_chunk(&self, batch_id: &str, chunk_index: u32) -> FileshResult<ChunkStatus> {
        validate_batch_id(batch_id)?;
        let key = chunk_key(batch_id, chunk_index);

        let mut status = ChunkStatus {
            exists: false,
            batch_id: batch_id.to_string(),
            chunk_index,
            size: 0,
            etag: None,
            uploaded: None,
        };
        if !self.store.exists(&key).await? {
            return Ok(status);
        }

        let info = self.store.stat(&key).await?;
        status.exists = true;
        status.size = info.size;
        status.etag = info.etag;
        status.uploaded = info.last_modified;
        Ok(status)
    }

    /// Fetch a chunk. A missing chunk is [`FileshError::NotFound`].
    pub async fn download_chunk(&self, batch_id: &str, chunk_index: u32) -> FileshResult<Bytes> {
        validate_batch_id(batch_id)?;
        let data = self.store.get(&chunk_key(batch_id, chunk_index)).await?;
        tracing::debug!(batch_id, chunk_index, bytes = data.len(), "chunk served");
        Ok(data)
    }
}
