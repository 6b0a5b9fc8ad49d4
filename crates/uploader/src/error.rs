//! Upload error types.

use std::path::PathBuf;

use geoupload_archive::PackError;
use geoupload_protocol::ValidationError;
use geoupload_transfer::{SessionError, TransferError};

/// Errors produced while uploading an entity.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid description for {}: {source}", filename.display())]
    InvalidDescription {
        filename: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error("invalid user item: {0}")]
    User(#[source] ValidationError),

    #[error("packaging failed: {0}")]
    Pack(#[from] PackError),

    #[error("upload session failed: {0}")]
    Session(#[from] SessionError),

    #[error("giving up after {retries} consecutive failures: {source}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        source: SessionError,
    },

    #[error("finish failed: {0}")]
    Finish(#[source] SessionError),

    #[error("subscriber failed: {0}")]
    Subscriber(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unsupported file type: {}", .0.display())]
    UnsupportedFileType(PathBuf),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
