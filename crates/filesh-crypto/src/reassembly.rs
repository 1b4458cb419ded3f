//! Reassembly & decryption of downloaded transport chunks
//!
//! The canonical path concatenates chunks in the order given (callers sort by
//! chunk index), splits off the leading nonce and performs one AEAD decrypt.
//! Nothing here re-sorts input.
//!
//! [`decrypt_with_recovery`] adds a short, fixed list of repair attempts for
//! malformed arrivals. Every attempt still has to pass GCM authentication, so
//! a repaired stream is the exact stream that was encrypted or nothing.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};

use crate::error::{CryptoError, CryptoResult, Diagnosis};
use crate::keys::EncryptionKey;
use crate::{NONCE_SIZE, STREAM_OVERHEAD, TAG_SIZE};

/// A repair applied by [`decrypt_with_recovery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// A chunk appeared twice back to back (a retried transfer stored twice)
    DroppedDuplicateChunks,
    /// The nonce sat at the end of the stream instead of the front
    TrailingNonce,
    /// Bytes beyond the size predicted by the file metadata were cut off
    TrimmedExcess,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStrategy::DroppedDuplicateChunks => "dropped duplicate chunks",
            RecoveryStrategy::TrailingNonce => "trailing nonce",
            RecoveryStrategy::TrimmedExcess => "trimmed excess bytes",
        };
        f.write_str(s)
    }
}

/// Output of [`decrypt_with_recovery`]
#[derive(Debug)]
pub struct Recovered {
    pub plaintext: Vec<u8>,
    /// `None` when the canonical path succeeded
    pub strategy: Option<RecoveryStrategy>,
}

/// Decrypt the ordered transport chunks of one file.
pub fn decrypt<T: AsRef<[u8]>>(chunks: &[T], key: &EncryptionKey) -> CryptoResult<Vec<u8>> {
    decrypt_expecting(chunks, key, None)
}

/// Like [`decrypt`], with the plaintext size from the file metadata used to
/// enrich the error on failure.
pub fn decrypt_expecting<T: AsRef<[u8]>>(
    chunks: &[T],
    key: &EncryptionKey,
    expected_plaintext: Option<u64>,
) -> CryptoResult<Vec<u8>> {
    let expected_size = expected_stream_len(expected_plaintext)?;
    let stream = filesh_chunks::concat(chunks);
    open(stream, key).map_err(|reason| failure(reason, stream_size(chunks), chunks.len(), expected_size))
}

/// Canonical decrypt, then a bounded sequence of deterministic repairs.
///
/// Each repair is logged at `warn`. When every attempt fails the error of
/// the canonical path is returned.
pub fn decrypt_with_recovery<T: AsRef<[u8]>>(
    chunks: &[T],
    key: &EncryptionKey,
    expected_plaintext: Option<u64>,
) -> CryptoResult<Recovered> {
    let expected_stream = expected_stream_len(expected_plaintext)?;
    let canonical_err = match decrypt_expecting(chunks, key, expected_plaintext) {
        Ok(plaintext) => {
            return Ok(Recovered {
                plaintext,
                strategy: None,
            })
        }
        Err(e) => e,
    };

    for strategy in [
        RecoveryStrategy::DroppedDuplicateChunks,
        RecoveryStrategy::TrailingNonce,
        RecoveryStrategy::TrimmedExcess,
    ] {
        let Some(candidate) = candidate_stream(strategy, chunks, expected_stream) else {
            continue;
        };
        tracing::warn!(%strategy, bytes = candidate.len(), "canonical decrypt failed, attempting recovery");

        match open(candidate, key) {
            Ok(plaintext) => {
                tracing::warn!(%strategy, "recovered ciphertext stream");
                return Ok(Recovered {
                    plaintext,
                    strategy: Some(strategy),
                });
            }
            Err(reason) => tracing::debug!(%strategy, reason, "recovery attempt failed"),
        }
    }

    Err(canonical_err)
}

/// Build the repaired stream for `strategy`, or `None` when the strategy
/// does not apply to this input.
fn candidate_stream<T: AsRef<[u8]>>(
    strategy: RecoveryStrategy,
    chunks: &[T],
    expected_stream: Option<u64>,
) -> Option<Vec<u8>> {
    match strategy {
        RecoveryStrategy::DroppedDuplicateChunks => {
            let mut kept: Vec<&[u8]> = Vec::with_capacity(chunks.len());
            for chunk in chunks.iter().map(AsRef::as_ref) {
                if kept.last().is_some_and(|prev| !chunk.is_empty() && *prev == chunk) {
                    continue;
                }
                kept.push(chunk);
            }
            (kept.len() < chunks.len()).then(|| filesh_chunks::concat(&kept))
        }
        RecoveryStrategy::TrailingNonce => {
            let stream = filesh_chunks::concat(chunks);
            if stream.len() < STREAM_OVERHEAD {
                return None;
            }
            let (body, nonce) = stream.split_at(stream.len() - NONCE_SIZE);
            let mut rotated = Vec::with_capacity(stream.len());
            rotated.extend_from_slice(nonce);
            rotated.extend_from_slice(body);
            Some(rotated)
        }
        RecoveryStrategy::TrimmedExcess => {
            let expected = usize::try_from(expected_stream?).ok()?;
            let mut stream = filesh_chunks::concat(chunks);
            if stream.len() <= expected {
                return None;
            }
            stream.truncate(expected);
            Some(stream)
        }
    }
}

/// One AEAD decrypt over `nonce || ciphertext || tag`, in place.
fn open(mut stream: Vec<u8>, key: &EncryptionKey) -> Result<Vec<u8>, &'static str> {
    if stream.len() < STREAM_OVERHEAD {
        return Err("stream too short");
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let tag_at = stream.len() - TAG_SIZE;
    let tag = Tag::clone_from_slice(&stream[tag_at..]);
    let nonce = Nonce::clone_from_slice(&stream[..NONCE_SIZE]);

    cipher
        .decrypt_in_place_detached(&nonce, b"", &mut stream[NONCE_SIZE..tag_at], &tag)
        .map_err(|_| "authentication failed: wrong key or corrupted data")?;

    stream.truncate(tag_at);
    stream.drain(..NONCE_SIZE);
    Ok(stream)
}

/// Stream length implied by a plaintext size from file metadata.
fn expected_stream_len(expected_plaintext: Option<u64>) -> CryptoResult<Option<u64>> {
    expected_plaintext
        .map(|size| {
            crate::stream::stream_len(size)
                .ok_or_else(|| CryptoError::Link(format!("file size {size} is out of range")))
        })
        .transpose()
}

fn stream_size<T: AsRef<[u8]>>(chunks: &[T]) -> u64 {
    chunks.iter().map(|c| c.as_ref().len() as u64).sum()
}

fn failure(
    reason: &str,
    actual_size: u64,
    chunk_count: usize,
    expected_size: Option<u64>,
) -> CryptoError {
    let diagnosis = if actual_size < STREAM_OVERHEAD as u64 {
        Diagnosis::TooShort
    } else if expected_size.is_some_and(|e| e != actual_size) {
        Diagnosis::SizeMismatch
    } else {
        Diagnosis::AuthenticationFailed
    };

    tracing::debug!(
        actual_size,
        expected_size,
        chunk_count,
        %diagnosis,
        "ciphertext stream failed to decrypt"
    );

    CryptoError::Decryption {
        reason: reason.to_string(),
        expected_size,
        actual_size,
        chunk_count,
        diagnosis,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::encrypt;
    use filesh_chunks::split_slices;
    use proptest::prelude::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8).collect()
    }

    #[test]
    fn test_chunked_roundtrip() {
        let key = EncryptionKey::generate();
        let data = sample(10_000);
        let stream = encrypt(&data, &key).unwrap();
        let chunks = split_slices(&stream, 1024).unwrap();
        assert_eq!(decrypt(&chunks, &key).unwrap(), data);
    }

    #[test]
    fn test_wrong_key_fails() {
        let stream = encrypt(b"secret", &EncryptionKey::generate()).unwrap();
        let err = decrypt(&[&stream], &EncryptionKey::generate()).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::Decryption {
                diagnosis: Diagnosis::AuthenticationFailed,
                ..
            }
        ));
    }

    #[test]
    fn test_reordered_chunks_fail() {
        let key = EncryptionKey::generate();
        let stream = encrypt(&sample(3000), &key).unwrap();
        let mut chunks = split_slices(&stream, 1000).unwrap();
        chunks.swap(1, 2);
        assert!(decrypt(&chunks, &key).unwrap_err().is_decryption());
    }

    #[test]
    fn test_missing_chunk_reports_sizes() {
        let key = EncryptionKey::generate();
        let data = sample(3000);
        let stream = encrypt(&data, &key).unwrap();
        let chunks = split_slices(&stream, 1000).unwrap();
        let partial = [chunks[0], chunks[1], chunks[3]];

        match decrypt_expecting(&partial, &key, Some(data.len() as u64)).unwrap_err() {
            CryptoError::Decryption {
                expected_size,
                actual_size,
                chunk_count,
                diagnosis,
                ..
            } => {
                assert_eq!(expected_size, Some(3028));
                assert_eq!(actual_size, 2028);
                assert_eq!(chunk_count, 3);
                assert_eq!(diagnosis, Diagnosis::SizeMismatch);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_too_short_stream() {
        let key = EncryptionKey::generate();
        let err = decrypt(&[&[0u8; 10][..]], &key).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::Decryption {
                diagnosis: Diagnosis::TooShort,
                ..
            }
        ));
        assert!(decrypt::<&[u8]>(&[], &key).is_err());
    }

    #[test]
    fn test_recovery_not_used_when_canonical_succeeds() {
        let key = EncryptionKey::generate();
        let stream = encrypt(b"fine", &key).unwrap();
        let out = decrypt_with_recovery(&[&stream], &key, Some(4)).unwrap();
        assert_eq!(out.plaintext, b"fine");
        assert_eq!(out.strategy, None);
    }

    #[test]
    fn test_recovery_drops_duplicate_chunk() {
        let key = EncryptionKey::generate();
        let data = sample(2500);
        let stream = encrypt(&data, &key).unwrap();
        let chunks = split_slices(&stream, 1000).unwrap();
        let doubled = [chunks[0], chunks[1], chunks[1], chunks[2]];

        assert!(decrypt(&doubled, &key).is_err());
        let out = decrypt_with_recovery(&doubled, &key, None).unwrap();
        assert_eq!(out.plaintext, data);
        assert_eq!(out.strategy, Some(RecoveryStrategy::DroppedDuplicateChunks));
    }

    #[test]
    fn test_recovery_trailing_nonce() {
        let key = EncryptionKey::generate();
        let stream = encrypt(b"nonce moved", &key).unwrap();
        let mut moved = stream[NONCE_SIZE..].to_vec();
        moved.extend_from_slice(&stream[..NONCE_SIZE]);

        let out = decrypt_with_recovery(&[&moved], &key, None).unwrap();
        assert_eq!(out.plaintext, b"nonce moved");
        assert_eq!(out.strategy, Some(RecoveryStrategy::TrailingNonce));
    }

    #[test]
    fn test_recovery_trims_excess() {
        let key = EncryptionKey::generate();
        let data = sample(500);
        let mut stream = encrypt(&data, &key).unwrap();
        stream.extend_from_slice(&[0u8; 7]);

        assert!(decrypt_with_recovery(&[&stream], &key, None).is_err());
        let out = decrypt_with_recovery(&[&stream], &key, Some(500)).unwrap();
        assert_eq!(out.plaintext, data);
        assert_eq!(out.strategy, Some(RecoveryStrategy::TrimmedExcess));
    }

    #[test]
    fn test_recovery_does_not_mask_corruption() {
        let key = EncryptionKey::generate();
        let mut stream = encrypt(&sample(800), &key).unwrap();
        stream[400] ^= 0x01;

        let err = decrypt_with_recovery(&[&stream], &key, Some(800)).unwrap_err();
        assert!(err.is_decryption());
    }

    #[test]
    fn test_out_of_range_size_is_rejected() {
        let key = EncryptionKey::generate();
        let stream = encrypt(b"data", &key).unwrap();

        let err = decrypt_expecting(&[&stream], &key, Some(u64::MAX)).unwrap_err();
        assert!(matches!(err, CryptoError::Link(_)));
        let err = decrypt_with_recovery(&[&stream], &key, Some(u64::MAX)).unwrap_err();
        assert!(matches!(err, CryptoError::Link(_)));
    }

    proptest! {
        #[test]
        fn encrypt_split_decrypt_identity(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            chunk_size in 1usize..1500,
        ) {
            let key = EncryptionKey::generate();
            let stream = encrypt(&data, &key).unwrap();
            let chunks = split_slices(&stream, chunk_size).unwrap();
            prop_assert_eq!(decrypt(&chunks, &key).unwrap(), data);
        }

        #[test]
        fn any_bit_flip_is_detected(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            chunk_size in 1usize..700,
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let key = EncryptionKey::generate();
            let mut stream = encrypt(&data, &key).unwrap();
            let at = position.index(stream.len());
            stream[at] ^= 1 << bit;

            let chunks = split_slices(&stream, chunk_size).unwrap();
            let result = decrypt(&chunks, &key);
            prop_assert!(
                matches!(result, Err(CryptoError::Decryption { .. })),
                "expected a decryption error"
            );
        }
    }
}
