//! Whole-file AES-256-GCM encryption
//!
//! Ciphertext stream format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! Every file gets a fresh nonce and exactly one AEAD call over its full
//! plaintext. Large sources may be *read* in segments, but the segments are
//! gathered into one buffer and encrypted in place, so the stream always
//! carries a single tag.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::io::Read;
use std::path::Path;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::EncryptionKey;
use crate::{NONCE_SIZE, STREAM_OVERHEAD};

/// Length of the ciphertext stream for a plaintext of `plaintext_len` bytes,
/// or `None` when that does not fit a `u64`.
pub fn stream_len(plaintext_len: u64) -> Option<u64> {
    plaintext_len.checked_add(STREAM_OVERHEAD as u64)
}

/// Encrypt a whole plaintext into one ciphertext stream.
pub fn encrypt(plaintext: &[u8], key: &EncryptionKey) -> CryptoResult<Vec<u8>> {
    let mut buffer = Vec::with_capacity(STREAM_OVERHEAD + plaintext.len());
    buffer.resize(NONCE_SIZE, 0);
    buffer.extend_from_slice(plaintext);
    seal_in_place(buffer, key)
}

/// Encrypt everything `reader` yields, reading `segment_size` bytes at a time.
///
/// `size_hint` pre-sizes the buffer; it does not bound the read.
pub fn encrypt_reader<R: Read>(
    mut reader: R,
    key: &EncryptionKey,
    size_hint: u64,
    segment_size: usize,
) -> CryptoResult<Vec<u8>> {
    let segment_size = segment_size.max(1);
    let mut buffer = Vec::with_capacity(STREAM_OVERHEAD + size_hint as usize);
    buffer.resize(NONCE_SIZE, 0);

    loop {
        let filled = buffer.len();
        buffer.resize(filled + segment_size, 0);
        let n = read_full(&mut reader, &mut buffer[filled..])?;
        buffer.truncate(filled + n);
        if n < segment_size {
            break;
        }
    }

    tracing::debug!(
        bytes = buffer.len() - NONCE_SIZE,
        segment_size,
        "plaintext loaded for encryption"
    );
    seal_in_place(buffer, key)
}

/// Encrypt a file from disk.
pub fn encrypt_file(path: &Path, key: &EncryptionKey, segment_size: usize) -> CryptoResult<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let size_hint = file.metadata().map(|m| m.len()).unwrap_or(0);
    encrypt_reader(file, key, size_hint, segment_size)
}

/// `buffer` holds `NONCE_SIZE` placeholder bytes followed by the plaintext.
fn seal_in_place(mut buffer: Vec<u8>, key: &EncryptionKey) -> CryptoResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    buffer[..NONCE_SIZE].copy_from_slice(&nonce_bytes);

    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut buffer[NONCE_SIZE..])
        .map_err(|e| CryptoError::Encryption(format!("aes-gcm rejected input: {e}")))?;

    buffer.extend_from_slice(&tag);
    Ok(buffer)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
