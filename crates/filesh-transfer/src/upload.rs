//! Upload state machine
//!
//! ```text
//! prepare:  create batch → generate key → encrypt each file once → spool
//!           ciphertext → plan transport chunks → persist (batch: pending)
//! run:      pending chunks → worker pool → completed (persisted one by one)
//!           retryable failure: error → pending, up to max_attempts
//!           permanent failure: error; too many → batch error (exhausted)
//! pause:    cancel token → in-flight chunks back to pending → batch paused
//! resume:   error → pending (attempts reset), skip completed, run again
//! ```
//!
//! Completed chunks are never sent again, so `resume` can be called any
//! number of times.

use bytes::Bytes;
use chrono::Utc;
use filesh_core::config::TransferConfig;
use filesh_core::FileMetadata;
use filesh_crypto::{encode_share_link, EncryptionKey};
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::api::BatchApi;
use crate::error::{TransferError, TransferResult};
use crate::pool::{FailureBudget, Job, Outcome, WorkerPool};
use crate::registry::{ActiveTransfer, TransferRegistry};
use crate::spool::Spool;
use crate::state::{BatchStatus, ChunkState, ChunkStatus, TransferStore, UploadState};

/// Progress callback type (bytes_done, bytes_total, message)
pub type ProgressFn = Arc<dyn Fn(u64, u64, &str) + Send + Sync>;

const DEFAULT_MIME: &str = "application/octet-stream";

/// One file to send
#[derive(Debug, Clone)]
pub enum UploadSource {
    Path(PathBuf),
    Bytes {
        name: String,
        mime_type: String,
        data: Bytes,
    },
}

impl UploadSource {
    fn name(&self) -> String {
        match self {
            UploadSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            UploadSource::Bytes { name, .. } => name.clone(),
        }
    }

    fn mime_type(&self) -> String {
        match self {
            UploadSource::Path(_) => DEFAULT_MIME.to_string(),
            UploadSource::Bytes { mime_type, .. } if !mime_type.is_empty() => mime_type.clone(),
            UploadSource::Bytes { .. } => DEFAULT_MIME.to_string(),
        }
    }
}

/// Result of one upload run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub batch_id: String,
    pub files: usize,
    pub chunks: usize,
    /// Chunks sent during this run; completed ones are skipped
    pub transferred: usize,
    /// Ciphertext bytes acknowledged for the whole batch
    pub bytes: u64,
}

/// Where a batch-wide chunk index points in the spooled streams
#[derive(Debug, Clone)]
struct ChunkSlot {
    file_id: String,
    chunk_index: u32,
    range: Range<usize>,
}

enum RunEnd {
    Finished,
    Cancelled,
    Exhausted,
}

#[derive(Clone)]
pub struct UploadManager {
    api: Arc<dyn BatchApi>,
    store: TransferStore,
    spool: Spool,
    registry: TransferRegistry,
    cfg: TransferConfig,
    progress: Option<ProgressFn>,
}

impl UploadManager {
    pub fn new(api: Arc<dyn BatchApi>, store: TransferStore, spool: Spool, cfg: TransferConfig) -> Self {
        Self {
            api,
            store,
            spool,
            registry: TransferRegistry::new(),
            cfg,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn store(&self) -> &TransferStore {
        &self.store
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Create a batch and run it to completion.
    pub async fn upload(&self, sources: Vec<UploadSource>) -> TransferResult<UploadSummary> {
        let upload = self.prepare(sources).await?;
        self.run(&upload.batch_id).await
    }

    /// Create the remote batch, encrypt and spool every file and persist the
    /// pending chunk plan. Nothing is uploaded yet.
    pub async fn prepare(&self, sources: Vec<UploadSource>) -> TransferResult<UploadState> {
        if sources.is_empty() {
            return Err(TransferError::Rejected("nothing to upload".into()));
        }

        let batch = self.api.create_batch().await?;
        let key = EncryptionKey::generate();
        let now = Utc::now();

        let mut metadata = Vec::with_capacity(sources.len());
        let mut chunks = Vec::new();
        let mut total_size = 0u64;
        let mut next_remote = 0u32;

        for source in sources {
            let file_id = uuid::Uuid::new_v4().to_string();
            let name = source.name();
            let mime_type = source.mime_type();

            let stream = self.encrypt_source(source, &key).await?;
            let stream_len = stream.len() as u64;
            let plaintext_size = stream_len - filesh_crypto::STREAM_OVERHEAD as u64;
            self.spool.write(&batch.id, &file_id, &stream).await?;

            let plan = filesh_chunks::plan_transport(
                &batch.id,
                &file_id,
                next_remote,
                stream_len,
                self.cfg.chunk_size,
            )?;
            debug!(batch_id = %batch.id, file = %name, bytes = stream_len, chunks = plan.len(), "file encrypted");

            metadata.push(FileMetadata {
                id: file_id.clone(),
                name,
                mime_type,
                size: plaintext_size,
                first_chunk: Some(next_remote),
                chunk_count: Some(plan.len() as u32),
            });
            next_remote += plan.len() as u32;
            total_size += stream_len;
            chunks.extend(plan.iter().map(|c| {
                ChunkState::pending(&batch.id, &file_id, c.chunk_index, c.remote_index, c.size_bytes)
            }));
        }

        let upload = UploadState {
            batch_id: batch.id.clone(),
            file_ids: metadata.iter().map(|m| m.id.clone()).collect(),
            encryption_key_b64: key.to_base64(),
            total_size,
            uploaded_size: 0,
            status: BatchStatus::Pending,
            metadata,
            chunk_size: self.cfg.chunk_size,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        info!(
            batch_id = %upload.batch_id,
            files = upload.file_ids.len(),
            chunks = chunks.len(),
            bytes = total_size,
            "batch prepared"
        );
        self.store.create_batch(upload.clone(), chunks).await?;
        Ok(upload)
    }

    async fn encrypt_source(&self, source: UploadSource, key: &EncryptionKey) -> TransferResult<Vec<u8>> {
        let key = key.clone();
        let segment = self.cfg.read_segment_size;
        let stream = tokio::task::spawn_blocking(move || match source {
            UploadSource::Path(path) => filesh_crypto::encrypt_file(&path, &key, segment),
            UploadSource::Bytes { data, .. } => filesh_crypto::encrypt(&data, &key),
        })
        .await
        .map_err(|e| filesh_crypto::CryptoError::Encryption(format!("encryption task failed: {e}")))??;
        Ok(stream)
    }

    /// Upload every chunk of a prepared batch that is not yet completed.
    pub async fn run(&self, batch_id: &str) -> TransferResult<UploadSummary> {
        let guard = self.registry.register(batch_id)?;
        self.run_registered(&guard, batch_id).await
    }

    /// Continue a paused, failed or interrupted batch: failed chunks get a
    /// fresh attempt budget, completed chunks are skipped.
    pub async fn resume(&self, batch_id: &str) -> TransferResult<UploadSummary> {
        let guard = self.registry.register(batch_id)?;
        let upload = self.load(batch_id).await?;
        if upload.status == BatchStatus::Completed {
            info!(batch_id, "batch already completed");
            return Ok(self.summary(&upload, 0).await);
        }

        let retried = self.store.requeue(batch_id, ChunkStatus::Error, true).await?;
        let interrupted = self.store.requeue(batch_id, ChunkStatus::Uploading, false).await?;
        info!(batch_id, retried, interrupted, "resuming upload");

        self.run_registered(&guard, batch_id).await
    }

    /// Abort a running upload. Returns false if the batch was not running.
    pub fn pause(&self, batch_id: &str) -> bool {
        self.registry.cancel(batch_id)
    }

    /// Abort if running and forget the batch locally.
    pub async fn cancel(&self, batch_id: &str) -> TransferResult<bool> {
        self.registry.cancel(batch_id);
        let existed = self.store.delete_batch(batch_id).await?;
        self.spool.remove_batch(batch_id).await?;
        info!(batch_id, existed, "upload cancelled");
        Ok(existed)
    }

    /// Share link for a batch recorded in local state.
    pub async fn share_link(&self, batch_id: &str, base_url: &str) -> TransferResult<String> {
        let upload = self.load(batch_id).await?;
        let key = EncryptionKey::from_base64(&upload.encryption_key_b64)?;
        Ok(encode_share_link(base_url, batch_id, &key, &upload.metadata)?)
    }

    /// Drop local records and spooled ciphertext not touched within the
    /// retention window. Returns the purged batch ids.
    pub async fn cleanup(&self) -> TransferResult<Vec<String>> {
        let retention = chrono::Duration::from_std(self.cfg.retention())
            .map_err(|e| TransferError::Rejected(format!("retention window: {e}")))?;
        let purged = self.store.purge_older_than(Utc::now() - retention).await?;
        for batch_id in &purged {
            self.spool.remove_batch(batch_id).await?;
        }
        Ok(purged)
    }

    async fn load(&self, batch_id: &str) -> TransferResult<UploadState> {
        self.store
            .get_upload(batch_id)
            .await
            .ok_or_else(|| TransferError::NotFound(format!("no local upload state for batch {batch_id}")))
    }

    async fn summary(&self, upload: &UploadState, transferred: usize) -> UploadSummary {
        UploadSummary {
            batch_id: upload.batch_id.clone(),
            files: upload.file_ids.len(),
            chunks: self.store.chunks_for(&upload.batch_id).await.len(),
            transferred,
            bytes: upload.uploaded_size,
        }
    }

    fn report(&self, done: u64, total: u64, message: &str) {
        if let Some(cb) = &self.progress {
            cb(done, total, message);
        }
    }

    async fn run_registered(&self, guard: &ActiveTransfer, batch_id: &str) -> TransferResult<UploadSummary> {
        let upload = self.load(batch_id).await?;
        if upload.status == BatchStatus::Completed {
            return Ok(self.summary(&upload, 0).await);
        }

        let all = self.store.chunks_for(batch_id).await;
        let total_chunks = all.len();
        let pending: Vec<ChunkState> = all
            .into_iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .collect();

        let mut streams = HashMap::new();
        for file_id in pending.iter().map(|c| c.file_id.as_str()).collect::<BTreeSet<_>>() {
            streams.insert(file_id.to_string(), self.spool.read(batch_id, file_id).await?);
        }
        let slots: HashMap<u32, ChunkSlot> = pending
            .iter()
            .map(|c| {
                let start = c.chunk_index as usize * upload.chunk_size;
                let slot = ChunkSlot {
                    file_id: c.file_id.clone(),
                    chunk_index: c.chunk_index,
                    range: start..start + c.size as usize,
                };
                (c.remote_index, slot)
            })
            .collect();

        self.store
            .update_upload(batch_id, |u| {
                u.status = BatchStatus::Uploading;
                u.last_error = None;
            })
            .await?;
        info!(batch_id, pending = pending.len(), total = total_chunks, "uploading chunks");
        self.report(upload.uploaded_size, upload.total_size, "uploading");

        let streams = Arc::new(streams);
        let slots = Arc::new(slots);
        let pool = {
            let api = self.api.clone();
            let store = self.store.clone();
            let streams = streams.clone();
            let slots = slots.clone();
            let batch_id: Arc<str> = Arc::from(batch_id);

            WorkerPool::spawn(
                self.cfg.max_concurrency,
                self.cfg.upload_timeout(),
                guard.token().child_token(),
                move |job: Job| {
                    let api = api.clone();
                    let store = store.clone();
                    let streams = streams.clone();
                    let slots = slots.clone();
                    let batch_id = batch_id.clone();
                    async move {
                        let slot = slots
                            .get(&job.index)
                            .ok_or_else(|| TransferError::chunk(job.index, "not part of this batch"))?;
                        let stream = streams
                            .get(&slot.file_id)
                            .ok_or_else(|| TransferError::chunk(job.index, "ciphertext not spooled"))?;
                        if slot.range.end > stream.len() {
                            return Err(TransferError::chunk(job.index, "chunk range exceeds spooled stream"));
                        }

                        store
                            .update_chunk(&batch_id, &slot.file_id, slot.chunk_index, |c| {
                                c.status = ChunkStatus::Uploading;
                                c.attempts = job.attempt;
                            })
                            .await?;

                        let data = stream.slice(slot.range.clone());
                        let expected = data.len() as u64;
                        let ack = api.upload_chunk(&batch_id, job.index, data).await?;
                        if ack.size != expected {
                            return Err(TransferError::chunk(
                                job.index,
                                format!("server stored {} bytes, sent {expected}", ack.size),
                            ));
                        }
                        Ok::<(), TransferError>(())
                    }
                },
            )
        };

        for chunk in &pending {
            pool.submit(Job::first(chunk.remote_index, chunk.attempts))?;
        }

        let mut budget = FailureBudget::new(total_chunks, &self.cfg);
        let mut transferred = 0usize;
        let driven = self
            .drive(&pool, batch_id, &slots, pending.len(), &mut budget, &mut transferred)
            .await;
        pool.shutdown(true).await;
        let end = driven?;

        match end {
            RunEnd::Cancelled => {
                if self.store.get_upload(batch_id).await.is_none() {
                    return Err(TransferError::NotFound(format!("batch {batch_id} was cancelled")));
                }
                let reset = self.store.requeue(batch_id, ChunkStatus::Uploading, false).await?;
                self.store
                    .update_upload(batch_id, |u| u.status = BatchStatus::Paused)
                    .await?;
                info!(batch_id, transferred, in_flight = reset, "upload paused");
                Err(TransferError::Paused(batch_id.to_string()))
            }
            RunEnd::Exhausted => {
                self.store.requeue(batch_id, ChunkStatus::Uploading, false).await?;
                let err = TransferError::BatchExhausted {
                    batch_id: batch_id.to_string(),
                    failed: budget.failed().len(),
                    total: budget.total(),
                };
                self.fail(batch_id, &err).await?;
                Err(err)
            }
            RunEnd::Finished if !budget.failed().is_empty() => {
                let mut failed = budget.failed().to_vec();
                failed.sort_unstable();
                let err = TransferError::Incomplete {
                    batch_id: batch_id.to_string(),
                    failed,
                };
                self.fail(batch_id, &err).await?;
                Err(err)
            }
            RunEnd::Finished => {
                let upload = self
                    .store
                    .update_upload(batch_id, |u| u.status = BatchStatus::Completed)
                    .await?;
                self.spool.remove_batch(batch_id).await?;
                info!(batch_id, transferred, bytes = upload.uploaded_size, "upload completed");
                self.report(upload.uploaded_size, upload.total_size, "completed");
                Ok(self.summary(&upload, transferred).await)
            }
        }
    }

    /// Coordinator: consumes worker outcomes until every submitted chunk
    /// completed or failed permanently, the budget ran out, or the run was
    /// cancelled.
    async fn drive(
        &self,
        pool: &WorkerPool<()>,
        batch_id: &str,
        slots: &HashMap<u32, ChunkSlot>,
        mut remaining: usize,
        budget: &mut FailureBudget,
        transferred: &mut usize,
    ) -> TransferResult<RunEnd> {
        while remaining > 0 {
            let Some(outcome) = pool.next().await else {
                return Ok(RunEnd::Cancelled);
            };

            match outcome {
                Outcome::Done { job, .. } => {
                    let Some(slot) = slots.get(&job.index) else { continue };
                    let upload = self
                        .store
                        .complete_chunk(batch_id, &slot.file_id, slot.chunk_index, job.attempt)
                        .await?;
                    remaining -= 1;
                    *transferred += 1;
                    debug!(batch_id, chunk_index = job.index, attempt = job.attempt, "chunk uploaded");
                    self.report(upload.uploaded_size, upload.total_size, &format!("chunk {}", job.index));
                }
                Outcome::Failed { job, error } => {
                    let Some(slot) = slots.get(&job.index) else { continue };
                    let retry = error.is_retryable() && job.attempt < self.cfg.max_attempts;
                    let status = if retry { ChunkStatus::Pending } else { ChunkStatus::Error };
                    self.store
                        .update_chunk(batch_id, &slot.file_id, slot.chunk_index, |c| {
                            c.status = status;
                            c.attempts = job.attempt;
                        })
                        .await?;

                    if retry {
                        let delay = self.cfg.retry_backoff(job.attempt);
                        warn!(batch_id, chunk_index = job.index, attempt = job.attempt, ?delay, %error, "chunk upload failed, retrying");
                        pool.submit(job.retry(delay))?;
                        continue;
                    }

                    error!(batch_id, chunk_index = job.index, attempts = job.attempt, %error, "chunk upload failed permanently");
                    remaining -= 1;
                    budget.record(job.index);
                    if budget.exhausted() {
                        return Ok(RunEnd::Exhausted);
                    }
                }
            }
        }
        Ok(RunEnd::Finished)
    }

    async fn fail(&self, batch_id: &str, err: &TransferError) -> TransferResult<()> {
        let message = err.to_string();
        error!(batch_id, "{message}");
        self.store
            .update_upload(batch_id, |u| {
                u.status = BatchStatus::Error;
                u.last_error = Some(message.clone());
            })
            .await?;
        Ok(())
    }
}
