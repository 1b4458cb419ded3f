//! filesh-crypto: client-side encryption for filesh transfers
//!
//! Architecture: Encrypt-then-Chunk with AES-256-GCM
//!
//! Pipeline: plaintext → one AEAD call (fresh nonce) → `nonce || ciphertext || tag`
//! → fixed-size transport chunks → upload
//!
//! ```text
//! EncryptionKey (256-bit random, one per batch, travels only in the share link)
//!   └── Ciphertext stream per file: [12-byte nonce][ciphertext][16-byte tag]
//!       └── sliced into transport chunks; boundaries carry no crypto meaning
//! ```
//!
//! Receiving reverses it: chunks sorted by index → concatenated → one AEAD
//! decrypt. There is a single authentication tag per file, so a stream
//! either authenticates as a whole or yields nothing.

pub mod error;
pub mod keys;
pub mod link;
pub mod reassembly;
pub mod stream;

pub use error::{CryptoError, CryptoResult, Diagnosis};
pub use keys::EncryptionKey;
pub use link::{decode_share_link, encode_share_link, ShareLink};
pub use reassembly::{decrypt, decrypt_expecting, decrypt_with_recovery, Recovered, RecoveryStrategy};
pub use stream::{encrypt, encrypt_file, encrypt_reader, stream_len};

/// Size of an AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes a ciphertext stream adds on top of its plaintext
pub const STREAM_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
