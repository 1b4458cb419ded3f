use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FileshError, FileshResult};

/// Top-level configuration (loaded from filesh.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileshConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub client: ClientConfig,
}

impl FileshConfig {
    /// Parse a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> FileshResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| FileshError::Config(format!("parsing {}: {e}", path.display())))?;
        config.transfer.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address (default: 0.0.0.0:8080)
    pub listen: String,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
    /// Largest accepted multipart chunk body in bytes (default: 100 MiB)
    pub max_chunk_bytes: usize,
    /// Expose Prometheus metrics on /metrics
    pub metrics: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket holding `{batchId}/{chunkIndex}` objects
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Extra upload attempts after the first failure
    pub upload_retries: usize,
    /// First retry delay in ms, doubled on every retry
    pub retry_base_delay_ms: u64,
}

/// Client-side chunk transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transport chunk size in bytes (default: 5 MiB)
    pub chunk_size: usize,
    /// Concurrent chunk transfers per batch
    pub max_concurrency: usize,
    /// Attempts per chunk before it is marked permanently failed
    pub max_attempts: u32,
    /// Batch fails once more than this share of chunks failed permanently
    pub max_failed_ratio: f64,
    /// Batch fails once more than this many chunks failed permanently
    pub max_failed_chunks: usize,
    pub upload_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Timeout for HEAD existence probes
    pub probe_timeout_secs: u64,
    /// Delay before a failed chunk is retried, doubled per attempt
    pub retry_backoff_ms: u64,
    /// Local transfer records older than this are purged by `cleanup`
    pub retention_days: u32,
    /// Read granularity when loading large files for encryption
    pub read_segment_size: usize,
}

impl TransferConfig {
    pub fn validate(&self) -> FileshResult<()> {
        if self.chunk_size == 0 {
            return Err(FileshError::Config("transfer.chunk_size must be > 0".into()));
        }
        if self.max_concurrency == 0 {
            return Err(FileshError::Config(
                "transfer.max_concurrency must be > 0".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(FileshError::Config("transfer.max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.max_failed_ratio) {
            return Err(FileshError::Config(
                "transfer.max_failed_ratio must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the filesh server API
    pub api_url: String,
    /// Base URL used when building share links
    pub share_base_url: String,
    /// JSON file holding upload/chunk state
    pub state_path: PathBuf,
    /// Directory holding spooled ciphertext for resumable uploads
    pub spool_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            log_level: "info".into(),
            log_format: "text".into(),
            max_chunk_bytes: 100 * 1024 * 1024,
            metrics: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "filesh".into(),
            enforce_tls: false,
            upload_retries: 3,
            retry_base_delay_ms: 2000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,
            max_concurrency: 3,
            max_attempts: 3,
            max_failed_ratio: 0.10,
            max_failed_chunks: 5,
            upload_timeout_secs: 120,
            download_timeout_secs: 120,
            probe_timeout_secs: 10,
            retry_backoff_ms: 1000,
            retention_days: 7,
            read_segment_size: 64 * 1024 * 1024,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080".into(),
            share_base_url: "http://localhost:8080".into(),
            state_path: PathBuf::from("~/.local/share/filesh/state.json"),
            spool_dir: PathBuf::from("~/.local/share/filesh/spool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:9090"
log_level = "debug"
log_format = "json"
metrics = false

[storage]
endpoint = "https://s3.example.com"
region = "eu-west-1"
bucket = "transfers"
enforce_tls = true
upload_retries = 5

[transfer]
chunk_size = 1048576
max_concurrency = 8
max_attempts = 4

[client]
api_url = "https://files.example.com"
state_path = "/tmp/filesh-state.json"
"#;
        let config: FileshConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9090");
        assert_eq!(config.server.log_format, "json");
        assert!(!config.server.metrics);
        assert_eq!(config.storage.bucket, "transfers");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.storage.upload_retries, 5);
        assert_eq!(config.transfer.chunk_size, 1048576);
        assert_eq!(config.transfer.max_concurrency, 8);
        assert_eq!(config.client.api_url, "https://files.example.com");
        assert_eq!(
            config.client.state_path,
            PathBuf::from("/tmp/filesh-state.json")
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config: FileshConfig = toml::from_str("").unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.storage.bucket, "filesh");
        assert_eq!(config.storage.retry_base_delay_ms, 2000);
        assert_eq!(config.transfer.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.transfer.max_failed_chunks, 5);
        assert_eq!(config.transfer.retention_days, 7);
        assert!(config.transfer.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
max_concurrency = 1
"#;
        let config: FileshConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.max_concurrency, 1);
        // Defaults
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(config.storage.region, "us-east-1");
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let cfg = TransferConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let cfg = TransferConfig {
            retry_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(cfg.retry_backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.retry_backoff(2), Duration::from_millis(200));
        assert_eq!(cfg.retry_backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileshConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.storage.bucket, "filesh");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = FileshConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FileshConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen, parsed.server.listen);
        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(config.transfer.chunk_size, parsed.transfer.chunk_size);
    }
}
