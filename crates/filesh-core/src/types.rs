use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FileshError, FileshResult};

/// How long a batch stays downloadable after creation.
pub const BATCH_TTL_DAYS: i64 = 7;

/// Plaintext description of one file in a batch.
///
/// Travels (compressed) inside the share link so the receiver can show names
/// and sizes before talking to the server. `first_chunk`/`chunk_count` locate
/// the file inside the batch-wide chunk index space; a single-file batch may
/// omit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    /// Plaintext size in bytes
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_chunk: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
}

impl FileMetadata {
    /// Batch-wide chunk indices of this file, when the sender recorded them.
    ///
    /// Fails when the span does not fit the `u32` index space.
    pub fn chunk_span(&self) -> FileshResult<Option<std::ops::Range<u32>>> {
        match (self.first_chunk, self.chunk_count) {
            (Some(first), Some(count)) => first
                .checked_add(count)
                .map(|end| Some(first..end))
                .ok_or_else(|| {
                    FileshError::InvalidInput(format!(
                        "chunk span {first}+{count} of file '{}' is out of range",
                        self.name
                    ))
                }),
            _ => Ok(None),
        }
    }
}

/// `POST /api/batch` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BatchMetadata {
    pub fn new(id: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            expires_at: created_at + Duration::days(BATCH_TTL_DAYS),
        }
    }
}

/// `GET /api/batch/{id}` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub total_size: u64,
    pub chunks_count: usize,
    pub last_activity: DateTime<Utc>,
}

/// One stored chunk as reported by a batch listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<DateTime<Utc>>,
}

/// `GET /api/batch/{id}/chunks` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunks {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub chunks: Vec<ChunkInfo>,
    pub total_size: u64,
}

/// `POST /api/upload/{batchId}/{chunkIndex}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub batch_id: String,
    pub chunk_index: u32,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_time_ms: Option<u64>,
}

/// Result of a chunk existence check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatus {
    pub exists: bool,
    pub batch_id: String,
    pub chunk_index: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<DateTime<Utc>>,
}

/// Envelope used by the batch endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// `GET /api/health` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Object key of a chunk: `{batchId}/{chunkIndex}`
pub fn chunk_key(batch_id: &str, chunk_index: u32) -> String {
    format!("{batch_id}/{chunk_index}")
}

/// Listing prefix of a batch: `{batchId}/`
pub fn batch_prefix(batch_id: &str) -> String {
    format!("{batch_id}/")
}

/// Parse a chunk index from a path segment or object-key suffix.
///
/// Only plain non-negative decimal integers are accepted.
pub fn parse_chunk_index(raw: &str) -> FileshResult<u32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FileshError::InvalidInput(format!(
            "invalid chunk index '{raw}'"
        )));
    }
    raw.parse::<u32>()
        .map_err(|e| FileshError::InvalidInput(format!("invalid chunk index '{raw}': {e}")))
}

/// Validate a batch id: non-empty, no path separators.
pub fn validate_batch_id(batch_id: &str) -> FileshResult<()> {
    if batch_id.is_empty() {
        return Err(FileshError::InvalidInput("batch ID is required".into()));
    }
    if batch_id.contains('/') || batch_id.contains("..") {
        return Err(FileshError::InvalidInput(format!(
            "invalid batch ID '{batch_id}'"
        )));
    }
    Ok(())
}
