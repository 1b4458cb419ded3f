//! Scripted in-memory `BatchApi` for state-machine tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use filesh_core::config::TransferConfig;
use filesh_core::types::{BatchChunks, BatchInfo, BatchMetadata, ChunkInfo, ChunkUploadResponse};
use filesh_transfer::{BatchApi, TransferError, TransferResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// Small chunk unit so scenario sizes stay cheap: 5 "MB" become 5 KiB.
pub const UNIT: usize = 1024;

pub fn test_config(chunk_size: usize, concurrency: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        max_concurrency: concurrency,
        retry_backoff_ms: 1,
        upload_timeout_secs: 30,
        download_timeout_secs: 30,
        probe_timeout_secs: 5,
        ..Default::default()
    }
}

/// Deterministic, non-repeating test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u32).wrapping_mul(2_654_435_761).to_le_bytes()[1]).collect()
}

#[derive(Default)]
pub struct FakeApi {
    chunks: Mutex<BTreeMap<(String, u32), Bytes>>,
    upload_log: Mutex<Vec<u32>>,
    download_log: Mutex<Vec<u32>>,
    /// index -> remaining injected retryable failures
    flaky: Mutex<HashMap<u32, u32>>,
    /// indices whose uploads are refused outright
    rejected: Mutex<Vec<u32>>,
    /// upload calls beyond this many never return
    hang_after: Mutex<Option<usize>>,
    download_delays: Mutex<HashMap<u32, Duration>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_times(&self, index: u32, times: u32) {
        self.flaky.lock().unwrap().insert(index, times);
    }

    pub fn reject(&self, index: u32) {
        self.rejected.lock().unwrap().push(index);
    }

    pub fn clear_failures(&self) {
        self.flaky.lock().unwrap().clear();
        self.rejected.lock().unwrap().clear();
    }

    pub fn hang_after(&self, uploads: Option<usize>) {
        *self.hang_after.lock().unwrap() = uploads;
    }

    pub fn delay_download(&self, index: u32, delay: Duration) {
        self.download_delays.lock().unwrap().insert(index, delay);
    }

    /// Every upload call so far, by chunk index, in call order
    pub fn uploads(&self) -> Vec<u32> {
        self.upload_log.lock().unwrap().clone()
    }

    /// Completed downloads, by chunk index, in completion order
    pub fn downloads(&self) -> Vec<u32> {
        self.download_log.lock().unwrap().clone()
    }

    pub fn put(&self, batch_id: &str, index: u32, data: Bytes) {
        self.chunks
            .lock()
            .unwrap()
            .insert((batch_id.to_string(), index), data);
    }

    pub fn remove(&self, batch_id: &str, index: u32) {
        self.chunks.lock().unwrap().remove(&(batch_id.to_string(), index));
    }

    pub fn stored(&self, batch_id: &str) -> Vec<(u32, usize)> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .filter(|((b, _), _)| b == batch_id)
            .map(|((_, i), data)| (*i, data.len()))
            .collect()
    }
}

#[async_trait]
impl BatchApi for FakeApi {
    async fn create_batch(&self) -> TransferResult<BatchMetadata> {
        Ok(BatchMetadata::new(uuid::Uuid::new_v4().to_string(), Utc::now()))
    }

    async fn upload_chunk(
        &self,
        batch_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> TransferResult<ChunkUploadResponse> {
        let calls = {
            let mut log = self.upload_log.lock().unwrap();
            log.push(chunk_index);
            log.len()
        };

        let hang = matches!(*self.hang_after.lock().unwrap(), Some(limit) if calls > limit);
        if hang {
            std::future::pending::<()>().await;
        }

        if self.rejected.lock().unwrap().contains(&chunk_index) {
            return Err(TransferError::Rejected(format!("chunk {chunk_index} refused")));
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&chunk_index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TransferError::Api("503 Service Unavailable".into()));
                }
            }
        }

        let size = data.len() as u64;
        self.put(batch_id, chunk_index, data);
        Ok(ChunkUploadResponse {
            success: true,
            batch_id: batch_id.to_string(),
            chunk_index,
            size,
            etag: None,
            uploaded: Some(Utc::now()),
            upload_time_ms: Some(0),
        })
    }

    async fn chunk_exists(&self, batch_id: &str, chunk_index: u32) -> TransferResult<bool> {
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .contains_key(&(batch_id.to_string(), chunk_index)))
    }

    async fn download_chunk(&self, batch_id: &str, chunk_index: u32) -> TransferResult<Bytes> {
        let delay = self.download_delays.lock().unwrap().get(&chunk_index).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let data = self
            .chunks
            .lock()
            .unwrap()
            .get(&(batch_id.to_string(), chunk_index))
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("{batch_id}/{chunk_index}")))?;
        self.download_log.lock().unwrap().push(chunk_index);
        Ok(data)
    }

    async fn batch_info(&self, batch_id: &str) -> TransferResult<BatchInfo> {
        let stored = self.stored(batch_id);
        if stored.is_empty() {
            return Err(TransferError::NotFound(format!("batch {batch_id}")));
        }
        let now = Utc::now();
        Ok(BatchInfo {
            id: batch_id.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::days(7),
            total_size: stored.iter().map(|(_, len)| *len as u64).sum(),
            chunks_count: stored.len(),
            last_activity: now,
        })
    }

    async fn list_chunks(&self, batch_id: &str) -> TransferResult<BatchChunks> {
        let stored = self.stored(batch_id);
        let now = Utc::now();
        Ok(BatchChunks {
            id: batch_id.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::days(7),
            total_size: stored.iter().map(|(_, len)| *len as u64).sum(),
            chunks: stored
                .into_iter()
                .map(|(index, len)| ChunkInfo {
                    index,
                    size: len as u64,
                    uploaded: Some(now),
                })
                .collect(),
        })
    }
}
