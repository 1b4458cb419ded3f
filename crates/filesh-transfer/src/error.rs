use filesh_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// One chunk failed in transit; retried up to the attempt limit
    #[error("chunk {index}: {reason}")]
    Chunk { index: u32, reason: String },

    #[error(
        "batch {batch_id} failed: {failed} of {total} chunks could not be transferred; \
         check the connection and run `filesh resume {batch_id}`"
    )]
    BatchExhausted {
        batch_id: String,
        failed: usize,
        total: usize,
    },

    #[error("batch {batch_id} incomplete: chunks {failed:?} failed; run `filesh resume {batch_id}` to retry them")]
    Incomplete { batch_id: String, failed: Vec<u32> },

    #[error("batch {batch_id} is missing chunks {missing:?}")]
    MissingChunks { batch_id: String, missing: Vec<u32> },

    #[error("batch {0} paused")]
    Paused(String),

    #[error("transfer of batch {0} cancelled")]
    Cancelled(String),

    #[error("batch {0} is already transferring")]
    AlreadyActive(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error: {0}")]
    Api(String),

    /// The server refused the request (4xx); retrying will not help
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Split(#[from] filesh_chunks::SplitError),

    #[error("transfer state: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    pub fn chunk(index: u32, reason: impl std::fmt::Display) -> Self {
        TransferError::Chunk {
            index,
            reason: reason.to_string(),
        }
    }

    /// Worth another attempt at the same chunk
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Chunk { .. } | TransferError::Api(_))
    }
}

pub type TransferResult<T> = Result<T, TransferError>;
