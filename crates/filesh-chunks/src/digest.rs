//! SHA-256 content digests
//!
//! Used to compare a received plaintext against what the sender hashed, and
//! by tests to check that a transfer reproduced its input byte-for-byte.

use sha2::{Digest as _, Sha256};
use std::io::Read;
use std::path::Path;

/// A SHA-256 digest (32 bytes)
pub type Digest = [u8; 32];

/// Digest a byte slice in memory.
pub fn digest_bytes(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Digest a file from disk without loading it whole.
pub fn digest_file(path: &Path) -> std::io::Result<Digest> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Lowercase hex rendering (64 chars)
pub fn digest_hex(digest: &Digest) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
