//! Upload session contract.
//!
//! An `UploadSession` owns one session key on the remote service. The
//! transfer loop drives it through fetch offset / transfer / finish; it never
//! retries on its own.

use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;

use geoupload_protocol::FileType;

use crate::TransferError;
use crate::chunked::ChunkReader;
use crate::types::FileHandle;

/// Boxed future returned by session methods.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Invoked after each acknowledged chunk with the number of bytes it carried.
///
/// Returning `ControlFlow::Break` stops the transfer before the next chunk.
pub type ChunkCallback<'a> = dyn FnMut(u64) -> ControlFlow<()> + Send + 'a;

/// Client side of the resumable upload protocol.
pub trait UploadSession: Send + Sync {
    /// Key identifying this entity on the remote service.
    fn session_key(&self) -> &str;

    /// Declared size of the entity in bytes.
    fn entity_size(&self) -> u64;

    /// Bytes the service has already durably received for this key.
    fn fetch_offset(&self) -> SessionFuture<'_, u64>;

    /// Sends the entity from `offset`, calling `on_chunk` after each
    /// acknowledged chunk.
    ///
    /// Returns the file handle once every byte is acknowledged, or `None` if
    /// `on_chunk` asked to stop.
    fn transfer<'a>(
        &'a self,
        reader: &'a mut ChunkReader,
        offset: u64,
        on_chunk: &'a mut ChunkCallback<'_>,
    ) -> SessionFuture<'a, Option<FileHandle>>;

    /// Closes the session and returns the remote cluster id.
    fn finish<'a>(&'a self, handle: &'a FileHandle) -> SessionFuture<'a, String>;
}

/// What a factory needs to open one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub session_key: String,
    pub entity_size: u64,
    pub file_type: FileType,
}

impl SessionRequest {
    /// Builds a request keyed by the content fingerprint `md5sum`.
    pub fn new(md5sum: &str, entity_size: u64, file_type: FileType) -> Self {
        Self {
            session_key: file_type.session_key(md5sum),
            entity_size,
            file_type,
        }
    }
}

/// Opens upload sessions. Chosen once per uploader (live or dry run).
pub trait SessionFactory: Send + Sync {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn UploadSession>, SessionError>;
}

/// Errors reported by an upload session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}
