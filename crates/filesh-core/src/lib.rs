//! filesh-core: types shared by the server, the transfer engine and the CLI

pub mod config;
pub mod error;
pub mod types;

pub use error::{FileshError, FileshResult};
pub use types::{batch_prefix, chunk_key, parse_chunk_index, FileMetadata};
