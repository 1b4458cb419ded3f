//! filesh-storage: OpenDAL object storage for `{batchId}/{chunkIndex}` chunks
//!
//! The server never sees plaintext: it stores opaque chunk bytes, answers
//! existence checks and summarizes batches from prefix listings.

pub mod batch;
pub mod chunk;
pub mod operator;
pub mod store;

pub use batch::BatchService;
pub use chunk::ChunkService;
pub use operator::{build_from_core_config, build_operator, memory_operator, S3Settings};
pub use store::{ObjectInfo, ObjectStore, RetryPolicy};
