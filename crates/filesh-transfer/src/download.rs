//! Download state machine
//!
//! Resolves a share link (falling back to local upload state for a missing
//! key or metadata), determines each file's chunk indices, fetches them
//! through the worker pool with retries and per-chunk timeouts, and hands
//! the complete, index-ordered set to the decryption engine exactly once.
//!
//! Chunks may arrive in any order; they are buffered by index and nothing is
//! decrypted until every index of the file is accounted for. Download
//! progress is not persisted: an interrupted download starts over.

use bytes::Bytes;
use filesh_core::config::TransferConfig;
use filesh_core::FileMetadata;
use filesh_crypto::{decode_share_link, EncryptionKey, RecoveryStrategy};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::BatchApi;
use crate::error::{TransferError, TransferResult};
use crate::pool::{Job, Outcome, WorkerPool};
use crate::registry::TransferRegistry;
use crate::state::TransferStore;
use crate::upload::ProgressFn;

/// A decrypted file held in memory
#[derive(Debug)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub plaintext: Vec<u8>,
    /// Set when the stream only decrypted after a repair
    pub recovered: Option<RecoveryStrategy>,
}

/// A decrypted file written to disk
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub metadata: FileMetadata,
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex SHA-256 of the written plaintext
    pub sha256: String,
    pub recovered: Option<RecoveryStrategy>,
}

#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub batch_id: String,
    pub files: Vec<DownloadedFile>,
}

/// Everything needed to fetch and decrypt a batch
#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    pub batch_id: String,
    pub key: EncryptionKey,
    pub files: Vec<FileMetadata>,
    /// False when no metadata was available and `files` is a placeholder
    pub metadata_known: bool,
}

#[derive(Clone)]
pub struct DownloadManager {
    api: Arc<dyn BatchApi>,
    store: Option<TransferStore>,
    registry: TransferRegistry,
    cfg: TransferConfig,
    recovery: bool,
    progress: Option<ProgressFn>,
}

impl DownloadManager {
    pub fn new(api: Arc<dyn BatchApi>, cfg: TransferConfig) -> Self {
        Self {
            api,
            store: None,
            registry: TransferRegistry::new(),
            cfg,
            recovery: false,
            progress: None,
        }
    }

    /// Local upload state to consult when a link lacks the key or metadata.
    pub fn with_store(mut self, store: TransferStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Try the bounded repair strategies when the canonical decrypt fails.
    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    /// Abort a running download. Returns false if none was running.
    pub fn cancel(&self, batch_id: &str) -> bool {
        self.registry.cancel(batch_id)
    }

    /// Decode a share link and fill in whatever it lacks from local state.
    pub async fn resolve(&self, link: &str) -> TransferResult<ResolvedBatch> {
        let decoded = decode_share_link(link)?;
        let local = match &self.store {
            Some(store) => store.get_upload(&decoded.batch_id).await,
            None => None,
        };

        let key = match (decoded.key, &local) {
            (Some(key), _) => key,
            (None, Some(upload)) => {
                debug!(batch_id = %decoded.batch_id, "key taken from local upload state");
                EncryptionKey::from_base64(&upload.encryption_key_b64)?
            }
            (None, None) => {
                return Err(TransferError::NotFound(format!(
                    "link for batch {} carries no key and no local state has it",
                    decoded.batch_id
                )))
            }
        };

        let (files, metadata_known) = match (decoded.metadata, local) {
            (Some(files), _) => (files, true),
            (None, Some(upload)) => (upload.metadata, true),
            (None, None) => {
                warn!(batch_id = %decoded.batch_id, "no file metadata; treating the batch as one file");
                (vec![placeholder(&decoded.batch_id)], false)
            }
        };

        Ok(ResolvedBatch {
            batch_id: decoded.batch_id,
            key,
            files,
            metadata_known,
        })
    }

    /// Determine how many chunks a batch has: from the chunk listing, or by
    /// probing `0, 1, 2, ...` until one is missing.
    pub async fn probe(&self, batch_id: &str) -> TransferResult<u32> {
        match self.api.list_chunks(batch_id).await {
            Ok(listing) => {
                let count = listing.chunks.iter().map(|c| c.index + 1).max().unwrap_or(0);
                debug!(batch_id, count, "chunk count from listing");
                return Ok(count);
            }
            Err(TransferError::NotFound(_)) => {
                return Err(TransferError::NotFound(format!("batch {batch_id}")));
            }
            Err(e) => warn!(batch_id, error = %e, "chunk listing failed, probing"),
        }

        let mut count = 0u32;
        loop {
            let exists = tokio::time::timeout(self.cfg.probe_timeout(), self.api.chunk_exists(batch_id, count))
                .await
                .map_err(|_| TransferError::chunk(count, "existence probe timed out"))??;
            if !exists {
                break;
            }
            count += 1;
        }
        debug!(batch_id, count, "chunk count from probing");
        Ok(count)
    }

    /// Fetch the given chunks concurrently and return them in the order of
    /// `indices`. Fails with [`TransferError::MissingChunks`] unless every
    /// index was fetched.
    pub async fn fetch_chunks(&self, batch_id: &str, indices: &[u32]) -> TransferResult<Vec<Bytes>> {
        let guard = self.registry.register(batch_id)?;
        self.fetch(guard.token(), batch_id, indices).await
    }

    /// Fetch and decrypt every file of a batch into memory.
    pub async fn receive(&self, link: &str) -> TransferResult<Vec<ReceivedFile>> {
        let batch = self.resolve(link).await?;
        let guard = self.registry.register(&batch.batch_id)?;
        let spans = self.spans(&batch).await?;

        let mut received = Vec::with_capacity(batch.files.len());
        for (meta, span) in batch.files.iter().zip(spans) {
            received.push(self.receive_file(guard.token(), &batch, meta, span).await?);
        }
        Ok(received)
    }

    /// Fetch and decrypt every file of a batch into `dest_dir`.
    pub async fn download(&self, link: &str, dest_dir: &Path) -> TransferResult<DownloadSummary> {
        let batch = self.resolve(link).await?;
        let guard = self.registry.register(&batch.batch_id)?;
        let spans = self.spans(&batch).await?;
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut names = HashSet::new();
        let mut files = Vec::with_capacity(batch.files.len());
        for (position, (meta, span)) in batch.files.iter().zip(spans).enumerate() {
            let name = claim_name(&mut names, safe_file_name(meta, position));
            let path = destination(dest_dir, &name)?;
            let file = self.receive_file(guard.token(), &batch, meta, span).await?;
            write_atomic(&path, &file.plaintext).await?;

            let sha256 = filesh_chunks::digest_hex(&filesh_chunks::digest_bytes(&file.plaintext));
            info!(batch_id = %batch.batch_id, path = %path.display(), bytes = file.plaintext.len(), "file written");
            files.push(DownloadedFile {
                bytes: file.plaintext.len() as u64,
                metadata: file.metadata,
                path,
                sha256,
                recovered: file.recovered,
            });
        }

        Ok(DownloadSummary {
            batch_id: batch.batch_id,
            files,
        })
    }

    /// Chunk index range of every file, in metadata order.
    ///
    /// Spans from the link are checked against the chunks the server holds
    /// before anything is fetched: they must fit below the stored count and
    /// must not overlap.
    async fn spans(&self, batch: &ResolvedBatch) -> TransferResult<Vec<Range<u32>>> {
        let known = batch
            .files
            .iter()
            .map(FileMetadata::chunk_span)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransferError::Rejected(format!("batch {}: {e}", batch.batch_id)))?;

        let count = self.probe(&batch.batch_id).await?;
        if count == 0 {
            return Err(TransferError::NotFound(format!("batch {} has no chunks", batch.batch_id)));
        }

        if known.iter().all(Option::is_some) {
            let spans: Vec<Range<u32>> = known.into_iter().flatten().collect();
            check_spans(&batch.batch_id, &spans, count)?;
            return Ok(spans);
        }
        if batch.files.len() != 1 {
            return Err(TransferError::Rejected(format!(
                "batch {} has {} files but no chunk layout in its metadata",
                batch.batch_id,
                batch.files.len()
            )));
        }
        Ok(vec![0..count])
    }

    async fn receive_file(
        &self,
        token: &CancellationToken,
        batch: &ResolvedBatch,
        meta: &FileMetadata,
        span: Range<u32>,
    ) -> TransferResult<ReceivedFile> {
        let indices: Vec<u32> = span.collect();
        info!(batch_id = %batch.batch_id, file = %meta.name, chunks = indices.len(), "downloading file");
        let chunks = self.fetch(token, &batch.batch_id, &indices).await?;

        let expected = batch.metadata_known.then_some(meta.size);
        let key = batch.key.clone();
        let recovery = self.recovery;
        let (plaintext, recovered) = tokio::task::spawn_blocking(move || {
            if recovery {
                filesh_crypto::decrypt_with_recovery(&chunks, &key, expected)
                    .map(|r| (r.plaintext, r.strategy))
            } else {
                filesh_crypto::decrypt_expecting(&chunks, &key, expected).map(|p| (p, None))
            }
        })
        .await
        .map_err(|e| TransferError::Api(format!("decryption task failed: {e}")))?
        .inspect_err(|e| error!(batch_id = %batch.batch_id, file = %meta.name, error = %e, "decryption failed"))?;

        if let Some(strategy) = recovered {
            warn!(batch_id = %batch.batch_id, file = %meta.name, %strategy, "file decrypted after recovery");
        }

        let mut metadata = meta.clone();
        if !batch.metadata_known {
            metadata.size = plaintext.len() as u64;
        }
        Ok(ReceivedFile {
            metadata,
            plaintext,
            recovered,
        })
    }

    async fn fetch(&self, token: &CancellationToken, batch_id: &str, indices: &[u32]) -> TransferResult<Vec<Bytes>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let pool = {
            let api = self.api.clone();
            let batch_id: Arc<str> = Arc::from(batch_id);
            WorkerPool::spawn(
                self.cfg.max_concurrency,
                self.cfg.download_timeout(),
                token.child_token(),
                move |job: Job| {
                    let api = api.clone();
                    let batch_id = batch_id.clone();
                    async move { api.download_chunk(&batch_id, job.index).await }
                },
            )
        };
        for &index in indices {
            pool.submit(Job::first(index, 0))?;
        }

        let mut received = BTreeMap::new();
        let driven = self.collect(&pool, batch_id, indices.len(), &mut received).await;
        pool.shutdown(true).await;
        let missing = driven?;

        if !missing.is_empty() {
            return Err(TransferError::MissingChunks {
                batch_id: batch_id.to_string(),
                missing,
            });
        }

        // every index is present, so this yields them all in the caller's order
        let mut ordered = Vec::with_capacity(indices.len());
        for index in indices {
            match received.remove(index) {
                Some(chunk) => ordered.push(chunk),
                None => {
                    return Err(TransferError::MissingChunks {
                        batch_id: batch_id.to_string(),
                        missing: vec![*index],
                    })
                }
            }
        }
        Ok(ordered)
    }

    /// Consume fetch outcomes into `received`. Returns the indices that could
    /// not be fetched.
    async fn collect(
        &self,
        pool: &WorkerPool<Bytes>,
        batch_id: &str,
        mut remaining: usize,
        received: &mut BTreeMap<u32, Bytes>,
    ) -> TransferResult<Vec<u32>> {
        let total = remaining;
        let mut bytes = 0u64;
        let mut missing = Vec::new();

        while remaining > 0 {
            let Some(outcome) = pool.next().await else {
                return Err(TransferError::Cancelled(batch_id.to_string()));
            };
            match outcome {
                Outcome::Done { job, value } => {
                    remaining -= 1;
                    bytes += value.len() as u64;
                    debug!(batch_id, chunk_index = job.index, bytes = value.len(), "chunk downloaded");
                    received.insert(job.index, value);
                    if let Some(cb) = &self.progress {
                        cb((total - remaining) as u64, total as u64, &format!("chunk {} ({bytes} bytes)", job.index));
                    }
                }
                Outcome::Failed { job, error } if error.is_retryable() && job.attempt < self.cfg.max_attempts => {
                    let delay = self.cfg.retry_backoff(job.attempt);
                    warn!(batch_id, chunk_index = job.index, attempt = job.attempt, ?delay, %error, "chunk download failed, retrying");
                    pool.submit(job.retry(delay))?;
                }
                Outcome::Failed { job, error } => {
                    error!(batch_id, chunk_index = job.index, attempts = job.attempt, %error, "chunk download failed");
                    remaining -= 1;
                    missing.push(job.index);
                }
            }
        }

        missing.sort_unstable();
        Ok(missing)
    }
}

fn placeholder(batch_id: &str) -> FileMetadata {
    FileMetadata {
        id: batch_id.to_string(),
        name: format!("{batch_id}.bin"),
        mime_type: "application/octet-stream".into(),
        size: 0,
        first_chunk: None,
        chunk_count: None,
    }
}

/// Every span lies inside `0..stored` and no chunk belongs to two files.
fn check_spans(batch_id: &str, spans: &[Range<u32>], stored: u32) -> TransferResult<()> {
    let mut sorted: Vec<&Range<u32>> = spans.iter().collect();
    sorted.sort_by_key(|span| span.start);

    let mut next_free = 0u32;
    for span in sorted {
        if span.end > stored {
            return Err(TransferError::Rejected(format!(
                "batch {batch_id}: metadata names chunks {}..{} but the server holds {stored}",
                span.start, span.end
            )));
        }
        if span.start < next_free {
            return Err(TransferError::Rejected(format!(
                "batch {batch_id}: chunk spans overlap at {}",
                span.start
            )));
        }
        next_free = span.end;
    }
    Ok(())
}

/// Final path component of the sender-supplied name, or `file-<n>` when
/// nothing usable is left.
fn safe_file_name(meta: &FileMetadata, position: usize) -> String {
    let name = meta
        .name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match name {
        "" | "." | ".." => format!("file-{}", position + 1),
        name if name.contains('\0') => format!("file-{}", position + 1),
        name => name.to_string(),
    }
}

/// `name`, or `stem (n).ext` for the first `n` not handed out yet.
fn claim_name(taken: &mut HashSet<String>, name: String) -> String {
    if taken.insert(name.clone()) {
        return name;
    }

    let path = Path::new(&name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1usize;
    loop {
        let candidate = format!("{stem} ({n}){ext}");
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// `dest_dir/name`, refusing anything that would land elsewhere.
fn destination(dest_dir: &Path, name: &str) -> TransferResult<PathBuf> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let path = dest_dir.join(name);
    if !single || path.parent() != Some(dest_dir) {
        return Err(TransferError::Rejected(format!(
            "refusing to write '{name}' outside {}",
            dest_dir.display()
        )));
    }
    Ok(path)
}

async fn write_atomic(path: &Path, data: &[u8]) -> TransferResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
