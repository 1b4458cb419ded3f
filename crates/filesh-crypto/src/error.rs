use std::fmt;
use thiserror::Error;

/// What the reassembled stream looked like when decryption failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// Fewer bytes than a nonce plus a tag
    TooShort,
    /// Length differs from what the file metadata predicts
    SizeMismatch,
    /// Length plausible but the tag did not verify (wrong key, corruption,
    /// or chunks missing/reordered)
    AuthenticationFailed,
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Diagnosis::TooShort => "stream shorter than nonce + tag",
            Diagnosis::SizeMismatch => "stream size does not match metadata",
            Diagnosis::AuthenticationFailed => "authentication tag mismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error(
        "decryption failed: {reason} ({diagnosis}; {actual_size} bytes from {chunk_count} chunks, expected {}); download the file again",
        expected_size.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
    )]
    Decryption {
        reason: String,
        /// Expected ciphertext stream length, when the plaintext size is known
        expected_size: Option<u64>,
        actual_size: u64,
        chunk_count: usize,
        diagnosis: Diagnosis,
    },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("share link: {0}")]
    Link(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    pub fn is_decryption(&self) -> bool {
        matches!(self, CryptoError::Decryption { .. })
    }
}

pub type CryptoResult<T> = Result<T, CryptoError>;
