//! Blob store over an OpenDAL operator: put / get / exists / stat / list
//! plus a reachability check for health reporting.
//!
//! Uploads retry with exponential backoff. This retry domain is the
//! server's own and is independent of the client's per-chunk retries.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use filesh_core::{FileshError, FileshResult};
use opendal::{ErrorKind, Operator};
use std::time::Duration;

/// Stat result for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Upload retry schedule: `retries` extra attempts, first delay
/// `base_delay`, doubling each time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &filesh_core::config::StorageConfig) -> Self {
        Self {
            retries: cfg.upload_retries,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    op: Operator,
    retry: RetryPolicy,
}

impl ObjectStore {
    pub fn new(op: Operator, retry: RetryPolicy) -> Self {
        Self { op, retry }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Store `data` under `key`, retrying transient failures.
    pub async fn put(&self, key: &str, data: Bytes) -> FileshResult<()> {
        let mut last_err = None;

        for attempt in 0..=self.retry.retries {
            if attempt > 0 {
                let delay = self.retry.delay(attempt);
                tracing::warn!(key, attempt, ?delay, "retrying object upload");
                tokio::time::sleep(delay).await;
            }

            match self.op.write(key, data.clone()).await {
                Ok(_) => {
                    tracing::debug!(key, bytes = data.len(), attempt, "object stored");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(key, attempt = attempt + 1, error = %e, "object upload failed");
                    last_err = Some(e);
                }
            }
        }

        Err(FileshError::Storage(format!(
            "upload of {key} failed after {} attempts: {}",
            self.retry.retries + 1,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub async fn get(&self, key: &str) -> FileshResult<Bytes> {
        let buf = self.op.read(key).await.map_err(|e| map_err(key, e))?;
        Ok(buf.to_bytes())
    }

    pub async fn exists(&self, key: &str) -> FileshResult<bool> {
        match self.op.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_err(key, e)),
        }
    }

    pub async fn stat(&self, key: &str) -> FileshResult<ObjectInfo> {
        let meta = self.op.stat(key).await.map_err(|e| map_err(key, e))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.content_length(),
            last_modified: meta
                .last_modified()
                .and_then(|t| parse_timestamp(&t.to_string())),
            etag: meta.etag().map(|s| s.trim_matches('"').to_string()),
        })
    }

    /// Objects directly under `prefix`, in listing order.
    pub async fn list(&self, prefix: &str) -> FileshResult<Vec<ObjectInfo>> {
        let entries = match self.op.list(prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_err(prefix, e)),
        };

        let keys: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.path().to_string())
            .filter(|path| path != prefix && !path.ends_with('/'))
            .collect();

        futures::future::try_join_all(keys.iter().map(|key| self.stat(key))).await
    }

    /// Reachability of the bucket, checked by listing its root.
    pub async fn check_health(&self) -> FileshResult<()> {
        self.op
            .list("/")
            .await
            .map(|_| ())
            .map_err(|e| FileshError::Storage(format!("storage unreachable: {e}")))
    }
}

fn map_err(key: &str, e: opendal::Error) -> FileshError {
    if e.kind() == ErrorKind::NotFound {
        FileshError::NotFound(key.to_string())
    } else {
        FileshError::Storage(format!("{key}: {e}"))
    }
}

/// Accepts RFC 3339 as well as chrono's `Display` form.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f UTC")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    fn store() -> ObjectStore {
        ObjectStore::new(
            memory_operator().unwrap(),
            RetryPolicy {
                retries: 1,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn memory_store_is_reachable() {
        let store = store();
        store.check_health().await.unwrap();
        store.put("b1/0", Bytes::from_static(b"x")).await.unwrap();
        store.check_health().await.unwrap();
    }

    #[test]
    fn retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn timestamps_in_both_formats() {
        let a = parse_timestamp("2025-03-01T10:00:00Z").unwrap();
        let b = parse_timestamp("2025-03-01 10:00:00 UTC").unwrap();
        assert_eq!(a, b);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[tokio::test]
    async fn put_get_stat() {
        let store = store();
        store.put("b1/0", Bytes::from_static(b"abcdef")).await.unwrap();

        assert!(store.exists("b1/0").await.unwrap());
        assert!(!store.exists("b1/1").await.unwrap());
        assert_eq!(store.get("b1/0").await.unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(store.stat("b1/0").await.unwrap().size, 6);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let err = store().get("nope/0").await.unwrap_err();
        assert!(matches!(err, FileshError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_by_prefix() {
        let store = store();
        store.put("b1/0", Bytes::from_static(b"aa")).await.unwrap();
        store.put("b1/1", Bytes::from_static(b"bbb")).await.unwrap();
        store.put("b2/0", Bytes::from_static(b"c")).await.unwrap();

        let mut listed = store.list("b1/").await.unwrap();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["b1/0", "b1/1"]);
        assert_eq!(listed.iter().map(|o| o.size).sum::<u64>(), 5);

        assert!(store.list("b3/").await.unwrap().is_empty());
    }
}
