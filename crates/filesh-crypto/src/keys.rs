//! The per-batch symmetric key

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// A 256-bit AES-GCM key. Zeroized on drop.
///
/// Generated once per upload batch and never sent to the server; it leaves
/// the sender only inside the share link.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Import raw key material, rejecting anything but 32 bytes.
    pub fn from_slice(raw: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] = raw.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Raw export
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Standard base64 of the raw bytes (the form kept in local state)
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("base64 decode: {e}")))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for EncryptionKey {}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_differ() {
        let k1 = EncryptionKey::generate();
        let k2 = EncryptionKey::generate();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_base64_export_import() {
        let key = EncryptionKey::generate();
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(EncryptionKey::from_base64(&encoded).unwrap(), key);
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            EncryptionKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(EncryptionKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let key = EncryptionKey::from_bytes([0xAB; KEY_SIZE]);
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("171"));
    }
}
