//! Fixed-size transport chunking
//!
//! A ciphertext stream is cut into `ceil(len / chunk_size)` chunks. Every chunk
//! is exactly `chunk_size` bytes except the last, which holds the remainder
//! (or a full `chunk_size` when the length divides evenly, never zero bytes).
//!
//! Chunk boundaries carry no cryptographic meaning: concatenating the chunks
//! in index order reproduces the input byte-for-byte.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("{0} chunks exceed the chunk index space")]
    TooManyChunks(usize),
}

/// A contiguous byte range of a split blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based position within the blob
    pub index: u32,
    /// Byte offset within the blob
    pub offset: u64,
    /// Chunk length in bytes
    pub length: usize,
}

impl Chunk {
    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.length
    }
}

/// A chunk of one file's ciphertext stream, addressed for transport.
///
/// `chunk_index` is the position inside the file's stream; `remote_index` is
/// the batch-wide index used in the object key `{batchId}/{remote_index}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportChunk {
    pub batch_id: String,
    pub file_id: String,
    pub chunk_index: u32,
    pub remote_index: u32,
    pub byte_range: Range<u64>,
    pub size_bytes: u64,
}

/// Number of chunks `split` produces for a blob of `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> Result<usize, SplitError> {
    if chunk_size == 0 {
        return Err(SplitError::ZeroChunkSize);
    }
    Ok(len.div_ceil(chunk_size))
}

/// Partition `data` into fixed-size chunks.
///
/// Pure and deterministic in `(data.len(), chunk_size)`. An empty blob yields
/// no chunks.
pub fn split(data: &[u8], chunk_size: usize) -> Result<Vec<Chunk>, SplitError> {
    let count = chunk_count(data.len(), chunk_size)?;
    if count > u32::MAX as usize {
        return Err(SplitError::TooManyChunks(count));
    }

    Ok((0..count)
        .map(|i| {
            let offset = i * chunk_size;
            Chunk {
                index: i as u32,
                offset: offset as u64,
                length: chunk_size.min(data.len() - offset),
            }
        })
        .collect())
}

/// Like [`split`], returning borrowed slices instead of ranges.
pub fn split_slices(data: &[u8], chunk_size: usize) -> Result<Vec<&[u8]>, SplitError> {
    Ok(split(data, chunk_size)?
        .iter()
        .map(|c| &data[c.range()])
        .collect())
}

/// Concatenate chunks in the order given.
pub fn concat<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<u8> {
    let total = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut out = Vec::with_capacity(total);
    for chunk in chunks {
        out.extend_from_slice(chunk.as_ref());
    }
    out
}

/// Lay out the transport chunks of one file whose stream is `stream_len`
/// bytes, starting at batch-wide index `first_remote_index`.
pub fn plan_transport(
    batch_id: &str,
    file_id: &str,
    first_remote_index: u32,
    stream_len: u64,
    chunk_size: usize,
) -> Result<Vec<TransportChunk>, SplitError> {
    if chunk_size == 0 {
        return Err(SplitError::ZeroChunkSize);
    }
    let size = chunk_size as u64;
    let count = stream_len.div_ceil(size);
    if first_remote_index as u64 + count > u32::MAX as u64 {
        return Err(SplitError::TooManyChunks(count as usize));
    }

    Ok((0..count)
        .map(|i| {
            let start = i * size;
            let end = (start + size).min(stream_len);
            TransportChunk {
                batch_id: batch_id.to_string(),
                file_id: file_id.to_string(),
                chunk_index: i as u32,
                remote_index: first_remote_index + i as u32,
                byte_range: start..end,
                size_bytes: end - start,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn empty_data_yields_no_chunks() {
        assert!(split(&[], 16).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(split(b"abc", 0), Err(SplitError::ZeroChunkSize));
        assert_eq!(chunk_count(3, 0), Err(SplitError::ZeroChunkSize));
    }

    #[test]
    fn small_blob_is_one_chunk() {
        let data = vec![7u8; 3 * MIB];
        let chunks = split(&data, 5 * MIB).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].length, 3 * MIB);
    }

    #[test]
    fn even_division_has_no_empty_tail() {
        let data = vec![1u8; 10 * MIB];
        let chunks = split(&data, 5 * MIB).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].length, 5 * MIB);
        assert_eq!(chunks[1].offset, (5 * MIB) as u64);
    }

    #[test]
    fn remainder_goes_to_last_chunk() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let chunks = split(&data, 300).unwrap();
        let lengths: Vec<usize> = chunks.iter().map(|c| c.length).collect();
        assert_eq!(lengths, vec![300, 300, 300, 100]);
    }

    #[test]
    fn transport_plan_uses_batch_offsets() {
        let plan = plan_transport("b1", "f2", 4, 25, 10).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].remote_index, 4);
        assert_eq!(plan[2].remote_index, 6);
        assert_eq!(plan[2].chunk_index, 2);
        assert_eq!(plan[2].byte_range, 20..25);
        assert_eq!(plan[2].size_bytes, 5);
    }

    proptest! {
        #[test]
        fn split_then_concat_is_identity(
            data in proptest::collection::vec(any::<u8>(), 0..=8192),
            chunk_size in 1usize..=2048,
        ) {
            let slices = split_slices(&data, chunk_size).unwrap();
            prop_assert_eq!(concat(&slices), data);
        }

        #[test]
        fn chunks_are_full_except_last(
            len in 1usize..=8192,
            chunk_size in 1usize..=2048,
        ) {
            let data = vec![0u8; len];
            let chunks = split(&data, chunk_size).unwrap();
            prop_assert_eq!(chunks.len(), len.div_ceil(chunk_size));
            let (last, rest) = chunks.split_last().unwrap();
            prop_assert!(rest.iter().all(|c| c.length == chunk_size));
            prop_assert!(last.length > 0 && last.length <= chunk_size);
        }

        #[test]
        fn transport_plan_matches_split(
            len in 0u64..=8192,
            chunk_size in 1usize..=2048,
        ) {
            let data = vec![0u8; len as usize];
            let plan = plan_transport("b", "f", 0, len, chunk_size).unwrap();
            let chunks = split(&data, chunk_size).unwrap();
            prop_assert_eq!(plan.len(), chunks.len());
            for (p, c) in plan.iter().zip(chunks.iter()) {
                prop_assert_eq!(p.byte_range.start, c.offset);
                prop_assert_eq!(p.size_bytes, c.length as u64);
            }
        }
    }
}
