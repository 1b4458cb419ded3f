//! Local copy of each file's ciphertext stream
//!
//! A resumed upload must send the very bytes whose first chunks already
//! reached the server, so the stream is written here once at encrypt time
//! and read back on every run. Layout: `{spool_dir}/{batchId}/{fileId}.bin`.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn path(&self, batch_id: &str, file_id: &str) -> PathBuf {
        self.dir.join(batch_id).join(format!("{file_id}.bin"))
    }

    /// Write a stream atomically (temp file, then rename).
    pub async fn write(&self, batch_id: &str, file_id: &str, stream: &[u8]) -> Result<()> {
        let path = self.path(batch_id, file_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating spool dir: {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, stream)
            .await
            .with_context(|| format!("writing spool file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming spool file: {}", path.display()))?;
        Ok(())
    }

    pub async fn read(&self, batch_id: &str, file_id: &str) -> Result<Bytes> {
        let path = self.path(batch_id, file_id);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading spooled ciphertext: {}", path.display()))?;
        Ok(Bytes::from(data))
    }

    /// Drop everything spooled for a batch. Missing is fine.
    pub async fn remove_batch(&self, batch_id: &str) -> Result<()> {
        let dir = self.dir.join(batch_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing spool dir: {}", dir.display())),
        }
    }
}
