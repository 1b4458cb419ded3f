//! filesh-transfer: resumable chunk transfer engine
//!
//! - `state`: persisted upload/chunk records (JSON file or memory)
//! - `pool`: fixed-size worker pool with per-chunk timeouts
//! - `upload` / `download`: the transfer state machines
//! - `api`: the batch/chunk API they drive (HTTP or direct storage)
//! - `registry`: cancellation handles of running transfers
//! - `spool`: local ciphertext kept for resume

pub mod api;
pub mod download;
pub mod error;
pub mod pool;
pub mod registry;
pub mod spool;
pub mod state;
pub mod upload;

pub use api::{BatchApi, HttpApi, StorageApi};
pub use download::{DownloadManager, DownloadSummary, DownloadedFile, ReceivedFile, ResolvedBatch};
pub use error::{TransferError, TransferResult};
pub use registry::TransferRegistry;
pub use spool::Spool;
pub use state::{BatchStatus, ChunkState, ChunkStatus, TransferStore, UploadState};
pub use upload::{ProgressFn, UploadManager, UploadSource, UploadSummary};
