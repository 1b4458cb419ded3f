//! Batch bookkeeping derived from `{batchId}/` prefix listings
//!
//! Batches have no record of their own in storage; a batch exists once it
//! has at least one chunk.

use chrono::{DateTime, Duration, Utc};
use filesh_core::types::{
    batch_prefix, parse_chunk_index, validate_batch_id, BatchChunks, BatchInfo, BatchMetadata,
    ChunkInfo, BATCH_TTL_DAYS,
};
use filesh_core::{FileshError, FileshResult};

use crate::store::{ObjectInfo, ObjectStore};

#[derive(Debug, Clone)]
pub struct BatchService {
    store: ObjectStore,
}

impl BatchService {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Assign a fresh batch id. Nothing is written until the first chunk.
    pub fn create_batch(&self) -> BatchMetadata {
        let meta = BatchMetadata::new(uuid::Uuid::new_v4().to_string(), Utc::now());
        tracing::info!(batch_id = %meta.id, expires_at = %meta.expires_at, "created batch");
        meta
    }

    /// Summarize a batch. An empty listing means the batch does not exist.
    pub async fn batch_info(&self, batch_id: &str) -> FileshResult<BatchInfo> {
        validate_batch_id(batch_id)?;
        let objects = self.store.list(&batch_prefix(batch_id)).await?;
        if objects.is_empty() {
            return Err(FileshError::NotFound(format!("batch {batch_id}")));
        }

        let (earliest, latest) = time_bounds(&objects);
        let created_at = earliest.unwrap_or_else(fallback_created_at);

        Ok(BatchInfo {
            id: batch_id.to_string(),
            created_at,
            expires_at: created_at + Duration::days(BATCH_TTL_DAYS),
            total_size: objects.iter().map(|o| o.size).sum(),
            chunks_count: objects.len(),
            last_activity: latest.unwrap_or(created_at),
        })
    }

    /// Stored chunks sorted by index. Keys whose suffix is not an index are
    /// skipped.
    pub async fn list_chunks(&self, batch_id: &str) -> FileshResult<BatchChunks> {
        validate_batch_id(batch_id)?;
        let prefix = batch_prefix(batch_id);
        let objects = self.store.list(&prefix).await?;

        let mut parsed = Vec::with_capacity(objects.len());
        let mut chunks = Vec::with_capacity(objects.len());
        for obj in objects {
            let suffix = obj.key.strip_prefix(&prefix).unwrap_or(&obj.key);
            let Ok(index) = parse_chunk_index(suffix) else {
                tracing::debug!(key = %obj.key, "skipping non-chunk object");
                continue;
            };
            chunks.push(ChunkInfo {
                index,
                size: obj.size,
                uploaded: obj.last_modified,
            });
            parsed.push(obj);
        }
        chunks.sort_by_key(|c| c.index);

        let created_at = time_bounds(&parsed).0.unwrap_or_else(fallback_created_at);

        Ok(BatchChunks {
            id: batch_id.to_string(),
            created_at,
            expires_at: created_at + Duration::days(BATCH_TTL_DAYS),
            total_size: chunks.iter().map(|c| c.size).sum(),
            chunks,
        })
    }
}

fn time_bounds(objects: &[ObjectInfo]) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let times = objects.iter().filter_map(|o| o.last_modified);
    (times.clone().min(), times.max())
}

fn fallback_created_at() -> DateTime<Utc> {
    Utc::now() - Duration::hours(24)
}
