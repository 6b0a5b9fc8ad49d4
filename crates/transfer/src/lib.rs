//! Resumable chunked transfer of one entity to the ingestion service.
//!
//! The [`UploadSession`] trait is the client-side contract (fetch offset,
//! transfer from offset, finish). [`HttpUploadSession`] talks to the live
//! service; [`FakeUploadSession`] mimics it against a local directory for
//! dry runs.

mod chunked;
mod fake;
mod http;
mod retry;
mod session;
mod types;
mod validation;

pub use chunked::{ChunkReader, ChunkWriter, md5sum_bytes, md5sum_file, md5sum_reader};
pub use fake::{FakeSessionFactory, FakeUploadSession};
pub use http::{HttpSessionConfig, HttpSessionFactory, HttpUploadSession};
pub use retry::RetryPolicy;
pub use session::{
    ChunkCallback, SessionError, SessionFactory, SessionFuture, SessionRequest, UploadSession,
};
pub use types::{Chunk, FileHandle};
pub use validation::validate_session_key;

use geoupload_protocol::constants::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Chunk size for an entity holding `item_count` items.
///
/// The average item size, clamped to `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
/// Raw entities pass `item_count = 1`, so large videos still go out in
/// bounded increments.
pub fn chunk_size(entity_size: u64, item_count: u64) -> u64 {
    (entity_size / item_count.max(1)).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Errors produced by the local side of a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),

    #[error("offset {offset} beyond entity size {size}")]
    OffsetOutOfRange { offset: u64, size: u64 },
}
