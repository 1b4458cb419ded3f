//! filesh-chunks: deterministic transport chunking and SHA-256 digests
//!
//! # Overview
//! - `split`: fixed-size slicing of a ciphertext stream into transport chunks
//! - `digest`: SHA-256 content digests used to verify round-trips

pub mod digest;
pub mod split;

pub use digest::{digest_bytes, digest_file, digest_hex, Digest};
pub use split::{
    chunk_count, concat, plan_transport, split, split_slices, Chunk, SplitError, TransportChunk,
};
