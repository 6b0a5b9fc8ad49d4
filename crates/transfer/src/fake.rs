//! Local stand-in for the ingestion service, used for dry runs.
//!
//! Each session stores its bytes at `<root>/<session_key>`; the durable offset
//! is the file length, so interrupted dry runs resume exactly like live ones.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use geoupload_protocol::FileType;
use tracing::debug;

use crate::chunked::{ChunkReader, ChunkWriter};
use crate::session::{
    ChunkCallback, SessionError, SessionFactory, SessionFuture, SessionRequest, UploadSession,
};
use crate::types::FileHandle;
use crate::validation::validate_session_key;

/// Opens [`FakeUploadSession`]s under one directory.
#[derive(Debug, Clone)]
pub struct FakeSessionFactory {
    root: PathBuf,
    fail_every: Option<u64>,
}

impl FakeSessionFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fail_every: None,
        }
    }

    /// Fails every `n`-th chunk of each session with a connection error.
    pub fn with_fail_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SessionFactory for FakeSessionFactory {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn UploadSession>, SessionError> {
        let session = FakeUploadSession::new(&self.root, request)?;
        Ok(Box::new(FakeUploadSession {
            fail_every: self.fail_every,
            ..session
        }))
    }
}

/// Upload session writing into a local directory.
#[derive(Debug)]
pub struct FakeUploadSession {
    path: PathBuf,
    session_key: String,
    entity_size: u64,
    file_type: FileType,
    fail_every: Option<u64>,
    chunks_seen: AtomicU64,
}

impl FakeUploadSession {
    pub fn new(root: &Path, request: SessionRequest) -> Result<Self, SessionError> {
        validate_session_key(&request.session_key)?;
        std::fs::create_dir_all(root)?;
        Ok(Self {
            path: root.join(&request.session_key),
            session_key: request.session_key,
            entity_size: request.entity_size,
            file_type: request.file_type,
            fail_every: None,
            chunks_seen: AtomicU64::new(0),
        })
    }

    /// Where the received bytes are stored.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn durable_offset(&self) -> Result<u64, SessionError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn inject_failure(&self) -> Result<(), SessionError> {
        let seen = self.chunks_seen.fetch_add(1, Ordering::Relaxed) + 1;
        match self.fail_every {
            Some(n) if seen % n == 0 => Err(SessionError::Connection(format!(
                "injected failure on chunk {seen}"
            ))),
            _ => Ok(()),
        }
    }
}

impl UploadSession for FakeUploadSession {
    fn session_key(&self) -> &str {
        &self.session_key
    }

    fn entity_size(&self) -> u64 {
        self.entity_size
    }

    fn fetch_offset(&self) -> SessionFuture<'_, u64> {
        Box::pin(async move { self.durable_offset() })
    }

    fn transfer<'a>(
        &'a self,
        reader: &'a mut ChunkReader,
        offset: u64,
        on_chunk: &'a mut ChunkCallback<'_>,
    ) -> SessionFuture<'a, Option<FileHandle>> {
        Box::pin(async move {
            let durable = self.durable_offset()?;
            if offset != durable {
                return Err(SessionError::Protocol(format!(
                    "offset {offset} does not match received {durable}"
                )));
            }

            reader.seek_to(offset)?;
            let mut writer = ChunkWriter::resume(&self.path, offset)?;
            while let Some(chunk) = reader.next_chunk()? {
                self.inject_failure()?;
                writer.write_chunk(&chunk)?;
                debug!(session_key = %self.session_key, offset = writer.written(), "fake chunk stored");
                if on_chunk(chunk.len()).is_break() {
                    return Ok(None);
                }
            }
            Ok(Some(FileHandle(self.session_key.clone())))
        })
    }

    fn finish<'a>(&'a self, handle: &'a FileHandle) -> SessionFuture<'a, String> {
        Box::pin(async move {
            let received = self.durable_offset()?;
            if received != self.entity_size {
                return Err(SessionError::Protocol(format!(
                    "finish with {received} of {} bytes received",
                    self.entity_size
                )));
            }
            Ok(format!("dryrun_{}_{}", self.file_type.as_str(), handle))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;
    use tempfile::TempDir;

    fn source(dir: &Path, data: &[u8]) -> PathBuf {
        let path = dir.join("entity.bin");
        std::fs::write(&path, data).unwrap();
        path
    }

    fn request(size: u64) -> SessionRequest {
        SessionRequest::new("0123abcd", size, FileType::Zip)
    }

    #[tokio::test]
    async fn transfer_and_finish() {
        let dir = TempDir::new().unwrap();
        let data = b"0123456789";
        let src = source(dir.path(), data);
        let factory = FakeSessionFactory::new(dir.path().join("out"));
        let session = factory.open(request(data.len() as u64)).unwrap();

        assert_eq!(session.session_key(), "geoupload_0123abcd.zip");
        assert_eq!(session.fetch_offset().await.unwrap(), 0);

        let mut reader = ChunkReader::open(&src, 4).unwrap();
        let mut sizes = Vec::new();
        let mut on_chunk = |n: u64| {
            sizes.push(n);
            ControlFlow::Continue(())
        };
        let handle = session
            .transfer(&mut reader, 0, &mut on_chunk)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(session.fetch_offset().await.unwrap(), 10);

        let cluster = session.finish(&handle).await.unwrap();
        assert_eq!(cluster, "dryrun_zip_geoupload_0123abcd.zip");
        let stored = std::fs::read(factory.root().join("geoupload_0123abcd.zip")).unwrap();
        assert_eq!(stored, data);
    }

    #[tokio::test]
    async fn stop_then_resume_from_durable_offset() {
        let dir = TempDir::new().unwrap();
        let src = source(dir.path(), b"abcdefghij");
        let factory = FakeSessionFactory::new(dir.path().join("out"));
        let session = factory.open(request(10)).unwrap();

        let mut reader = ChunkReader::open(&src, 3).unwrap();
        let mut stop = |_: u64| ControlFlow::Break(());
        let stopped = session.transfer(&mut reader, 0, &mut stop).await.unwrap();
        assert!(stopped.is_none());

        let offset = session.fetch_offset().await.unwrap();
        assert_eq!(offset, 3);
        let mut go = |_: u64| ControlFlow::Continue(());
        let handle = session.transfer(&mut reader, offset, &mut go).await.unwrap();
        assert!(handle.is_some());
        let stored = std::fs::read(dir.path().join("out/geoupload_0123abcd.zip")).unwrap();
        assert_eq!(stored, b"abcdefghij");
    }

    #[tokio::test]
    async fn injected_failures_are_retriable() {
        let dir = TempDir::new().unwrap();
        let src = source(dir.path(), b"abcdefghij");
        let factory = FakeSessionFactory::new(dir.path().join("out")).with_fail_every(2);
        let session = factory.open(request(10)).unwrap();

        let mut reader = ChunkReader::open(&src, 3).unwrap();
        let mut go = |_: u64| ControlFlow::Continue(());
        let err = session.transfer(&mut reader, 0, &mut go).await.unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(session.fetch_offset().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn mismatched_offset_is_a_protocol_error() {
        let dir = TempDir::new().unwrap();
        let src = source(dir.path(), b"abc");
        let session = FakeSessionFactory::new(dir.path()).open(request(3)).unwrap();
        let mut reader = ChunkReader::open(&src, 3).unwrap();
        let mut go = |_: u64| ControlFlow::Continue(());
        let err = session.transfer(&mut reader, 2, &mut go).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[tokio::test]
    async fn finish_requires_complete_entity() {
        let dir = TempDir::new().unwrap();
        let session = FakeSessionFactory::new(dir.path()).open(request(5)).unwrap();
        let err = session
            .finish(&FileHandle("h".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[test]
    fn rejects_unsafe_key() {
        let dir = TempDir::new().unwrap();
        let bad = SessionRequest {
            session_key: "../escape".into(),
            entity_size: 1,
            file_type: FileType::Zip,
        };
        assert!(FakeSessionFactory::new(dir.path()).open(bad).is_err());
    }
}
