//! Local transfer state: one `UploadState` per batch, one `ChunkState` per
//! (batch, file, chunk).
//!
//! Two backends are available:
//!   - **JSON** (default): whole snapshot rewritten atomically via temp+rename.
//!   - **Memory**: for tests and throwaway transfers.
//!
//! Both implement `StateBackend`. [`TransferStore`] wraps either behind an
//! async mutex, so every read-modify-write on a record (and on the batch
//! counters it feeds) is serialized, and every mutation is persisted before
//! the lock is released.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use filesh_core::FileMetadata;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Uploading,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

/// Persisted state of one upload batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadState {
    pub batch_id: String,
    pub file_ids: Vec<String>,
    /// Standard base64 of the raw batch key
    pub encryption_key_b64: String,
    /// Ciphertext bytes to transfer across all files
    pub total_size: u64,
    /// Ciphertext bytes acknowledged by the server
    pub uploaded_size: u64,
    pub status: BatchStatus,
    pub metadata: Vec<FileMetadata>,
    /// Transport chunk size the batch was split with
    pub chunk_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted state of one transport chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkState {
    pub batch_id: String,
    pub file_id: String,
    /// Position within the file's ciphertext stream
    pub chunk_index: u32,
    /// Batch-wide index used in the object key
    pub remote_index: u32,
    /// True iff the server acknowledged this exact chunk
    pub uploaded: bool,
    pub size: u64,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl ChunkState {
    pub fn pending(batch_id: &str, file_id: &str, chunk_index: u32, remote_index: u32, size: u64) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            file_id: file_id.to_string(),
            chunk_index,
            remote_index,
            uploaded: false,
            size,
            status: ChunkStatus::Pending,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        chunk_record_key(&self.batch_id, &self.file_id, self.chunk_index)
    }
}

/// Record key of a chunk: `{batchId}/{fileId}/{chunkIndex}`
pub fn chunk_record_key(batch_id: &str, file_id: &str, chunk_index: u32) -> String {
    format!("{batch_id}/{file_id}/{chunk_index}")
}

/// Everything the store persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub uploads: BTreeMap<String, UploadState>,
    #[serde(default)]
    pub chunks: BTreeMap<String, ChunkState>,
}

/// Storage for [`StateSnapshot`]s.
pub trait StateBackend: Send {
    /// Load the last persisted snapshot (empty if none).
    fn load(&mut self) -> Result<StateSnapshot>;
    /// Durably replace the persisted snapshot.
    fn persist(&mut self, snapshot: &StateSnapshot) -> Result<()>;
}

/// Snapshot kept in a JSON file, replaced atomically (write then rename)
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonStateFile {
    fn load(&mut self) -> Result<StateSnapshot> {
        if !self.path.exists() {
            return Ok(StateSnapshot::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading transfer state: {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing transfer state: {}", self.path.display()))
    }

    fn persist(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(snapshot).context("serializing transfer state")?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing transfer state temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming transfer state: {}", self.path.display()))?;
        Ok(())
    }
}

/// Non-durable backend
#[derive(Default)]
pub struct MemoryState {
    snapshot: StateSnapshot,
}

impl StateBackend for MemoryState {
    fn load(&mut self) -> Result<StateSnapshot> {
        Ok(self.snapshot.clone())
    }

    fn persist(&mut self, snapshot: &StateSnapshot) -> Result<()> {
        self.snapshot = snapshot.clone();
        Ok(())
    }
}

struct StoreInner {
    backend: Box<dyn StateBackend>,
    snapshot: StateSnapshot,
    /// (updated_at, batch_id) for retention cleanup
    by_updated: BTreeSet<(DateTime<Utc>, String)>,
}

impl StoreInner {
    fn new(backend: Box<dyn StateBackend>, snapshot: StateSnapshot) -> Self {
        let by_updated = updated_index(&snapshot);
        Self {
            backend,
            snapshot,
            by_updated,
        }
    }

    /// Apply `f` to a copy of the snapshot. The copy becomes current only
    /// after it was persisted, so a failed write leaves memory as it was.
    fn transact<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateSnapshot) -> Result<T>,
    {
        let mut next = self.snapshot.clone();
        let out = f(&mut next)?;
        self.backend.persist(&next)?;
        self.by_updated = updated_index(&next);
        self.snapshot = next;
        Ok(out)
    }
}

fn updated_index(snapshot: &StateSnapshot) -> BTreeSet<(DateTime<Utc>, String)> {
    snapshot
        .uploads
        .values()
        .map(|u| (u.updated_at, u.batch_id.clone()))
        .collect()
}

fn chunks_of<'a>(snapshot: &'a StateSnapshot, batch_id: &str) -> impl Iterator<Item = &'a ChunkState> + 'a {
    let prefix = format!("{batch_id}/");
    snapshot
        .chunks
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .map(|(_, c)| c)
}

/// Shared handle to the persisted transfer state
#[derive(Clone)]
pub struct TransferStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl TransferStore {
    pub fn open(mut backend: Box<dyn StateBackend>) -> Result<Self> {
        let snapshot = backend.load()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner::new(backend, snapshot))),
        })
    }

    /// JSON file backend at `path`
    pub fn open_json(path: &Path) -> Result<Self> {
        Self::open(Box::new(JsonStateFile::new(path)))
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::new(
                Box::new(MemoryState::default()),
                StateSnapshot::default(),
            ))),
        }
    }

    /// Insert a new batch together with all of its chunk records.
    pub async fn create_batch(&self, upload: UploadState, chunks: Vec<ChunkState>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.transact(|snapshot| {
            for chunk in chunks {
                snapshot.chunks.insert(chunk.key(), chunk);
            }
            snapshot.uploads.insert(upload.batch_id.clone(), upload);
            Ok(())
        })
    }

    pub async fn get_upload(&self, batch_id: &str) -> Option<UploadState> {
        self.inner.lock().await.snapshot.uploads.get(batch_id).cloned()
    }

    /// All batches, most recently updated first
    pub async fn list_uploads(&self) -> Vec<UploadState> {
        let inner = self.inner.lock().await;
        inner
            .by_updated
            .iter()
            .rev()
            .filter_map(|(_, id)| inner.snapshot.uploads.get(id).cloned())
            .collect()
    }

    /// Read-modify-write of an upload record; bumps `updated_at`.
    pub async fn update_upload<F>(&self, batch_id: &str, f: F) -> Result<UploadState>
    where
        F: FnOnce(&mut UploadState),
    {
        let mut inner = self.inner.lock().await;
        inner.transact(|snapshot| {
            let upload = snapshot
                .uploads
                .get_mut(batch_id)
                .with_context(|| format!("no upload state for batch {batch_id}"))?;
            f(upload);
            upload.updated_at = Utc::now();
            Ok(upload.clone())
        })
    }

    /// Read-modify-write of a chunk record; bumps `updated_at`.
    pub async fn update_chunk<F>(&self, batch_id: &str, file_id: &str, chunk_index: u32, f: F) -> Result<ChunkState>
    where
        F: FnOnce(&mut ChunkState),
    {
        let mut inner = self.inner.lock().await;
        let key = chunk_record_key(batch_id, file_id, chunk_index);
        inner.transact(|snapshot| {
            let chunk = snapshot
                .chunks
                .get_mut(&key)
                .with_context(|| format!("no chunk state for {key}"))?;
            f(chunk);
            chunk.updated_at = Utc::now();
            Ok(chunk.clone())
        })
    }

    /// Mark a chunk acknowledged and add its size to the batch counter, as
    /// one atomic update. Completing an already completed chunk is a no-op.
    pub async fn complete_chunk(&self, batch_id: &str, file_id: &str, chunk_index: u32, attempts: u32) -> Result<UploadState> {
        let mut inner = self.inner.lock().await;
        let key = chunk_record_key(batch_id, file_id, chunk_index);
        inner.transact(|snapshot| {
            let now = Utc::now();
            let chunk = snapshot
                .chunks
                .get_mut(&key)
                .with_context(|| format!("no chunk state for {key}"))?;
            let newly_completed = !chunk.uploaded;
            let size = chunk.size;
            chunk.uploaded = true;
            chunk.status = ChunkStatus::Completed;
            chunk.attempts = attempts;
            chunk.updated_at = now;

            let upload = snapshot
                .uploads
                .get_mut(batch_id)
                .with_context(|| format!("no upload state for batch {batch_id}"))?;
            if newly_completed {
                upload.uploaded_size += size;
            }
            upload.updated_at = now;
            Ok(upload.clone())
        })
    }

    /// Chunks of a batch, ordered by batch-wide index
    pub async fn chunks_for(&self, batch_id: &str) -> Vec<ChunkState> {
        let inner = self.inner.lock().await;
        let mut chunks: Vec<ChunkState> = chunks_of(&inner.snapshot, batch_id).cloned().collect();
        chunks.sort_by_key(|c| c.remote_index);
        chunks
    }

    /// Set every chunk of the batch in `from` status to `Pending`.
    /// `reset_attempts` also zeroes the attempt counter. Returns how many
    /// records changed.
    pub async fn requeue(&self, batch_id: &str, from: ChunkStatus, reset_attempts: bool) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if !chunks_of(&inner.snapshot, batch_id).any(|c| c.status == from) {
            return Ok(0);
        }

        let prefix = format!("{batch_id}/");
        inner.transact(|snapshot| {
            let now = Utc::now();
            let mut changed = 0;
            for (_, chunk) in snapshot
                .chunks
                .range_mut(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
            {
                if chunk.status == from {
                    chunk.status = ChunkStatus::Pending;
                    if reset_attempts {
                        chunk.attempts = 0;
                    }
                    chunk.updated_at = now;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }

    /// Remove a batch and all of its chunk records.
    pub async fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let exists = inner.snapshot.uploads.contains_key(batch_id)
            || chunks_of(&inner.snapshot, batch_id).next().is_some();
        if !exists {
            return Ok(false);
        }
        inner.transact(|snapshot| Ok(remove_batch(snapshot, batch_id)))
    }

    /// Remove every batch whose `updated_at` is older than `cutoff`.
    /// Returns the removed batch ids.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .by_updated
            .iter()
            .take_while(|(updated, _)| *updated < cutoff)
            .map(|(_, id)| id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        inner.transact(|snapshot| {
            for batch_id in &stale {
                remove_batch(snapshot, batch_id);
            }
            Ok(())
        })?;
        tracing::info!(count = stale.len(), %cutoff, "purged stale transfer records");
        Ok(stale)
    }
}

fn remove_batch(snapshot: &mut StateSnapshot, batch_id: &str) -> bool {
    let removed = snapshot.uploads.remove(batch_id).is_some();
    let keys: Vec<String> = chunks_of(snapshot, batch_id).map(ChunkState::key).collect();
    for key in &keys {
        snapshot.chunks.remove(key);
    }
    removed || !keys.is_empty()
}
