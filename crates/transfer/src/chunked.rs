use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

use crate::TransferError;
use crate::types::Chunk;

// ---------------------------------------------------------------------------
// Fingerprint helpers
// ---------------------------------------------------------------------------

const HASH_BUF_SIZE: usize = 1024 * 1024;

/// Computes MD5 of `data` and returns the hex-encoded digest.
pub fn md5sum_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Computes MD5 of everything left in `reader`.
pub fn md5sum_reader<R: Read>(reader: &mut R) -> Result<String, TransferError> {
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Computes MD5 of an entire file.
pub fn md5sum_file(path: &Path) -> Result<String, TransferError> {
    let mut file = File::open(path)?;
    md5sum_reader(&mut file)
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Reads an entity in fixed-size chunks, starting from any offset.
pub struct ChunkReader {
    file: File,
    chunk_size: usize,
    offset: u64,
    size: u64,
}

impl ChunkReader {
    /// Opens `path` for chunked reading.
    pub fn open(path: &Path, chunk_size: u64) -> Result<Self, TransferError> {
        Self::new(File::open(path)?, chunk_size)
    }

    /// Wraps an already open file (e.g. a spooled temporary archive).
    ///
    /// The size is taken from the file metadata and the reader starts at 0.
    pub fn new(mut file: File, chunk_size: u64) -> Result<Self, TransferError> {
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file,
            chunk_size: chunk_size.max(1) as usize,
            offset: 0,
            size,
        })
    }

    /// Seeks to the given byte offset (for resume).
    pub fn seek_to(&mut self, offset: u64) -> Result<(), TransferError> {
        if offset > self.size {
            return Err(TransferError::OffsetOutOfRange {
                offset,
                size: self.size,
            });
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next chunk. Returns `None` at the end of the entity.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(None);
        }

        let read_size = remaining.min(self.chunk_size as u64);
        let mut data = Vec::with_capacity(read_size as usize);
        (&mut self.file).take(read_size).read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }

        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset = chunk.end();
        Ok(Some(chunk))
    }

    /// Current byte offset.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total entity size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes remaining to read.
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }

    /// Configured chunk size.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size as u64
    }
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

/// Writes chunks of one entity to disk at exact offsets.
///
/// Used by the fake session to stand in for the service's durable storage.
pub struct ChunkWriter {
    path: PathBuf,
    written: u64,
}

impl ChunkWriter {
    /// Opens `path` for writing from `offset`, discarding anything past it.
    ///
    /// Bytes beyond `offset` were never acknowledged, so they are dropped
    /// rather than trusted.
    pub fn resume(path: &Path, offset: u64) -> Result<Self, TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.set_len(offset)?;
        Ok(Self {
            path: path.to_path_buf(),
            written: offset,
        })
    }

    /// Writes a chunk and syncs it, so the new length is durable.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        let mut file = std::fs::OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        file.write_all(&chunk.data)?;
        file.sync_data()?;
        self.written = self.written.max(chunk.end());
        Ok(())
    }

    /// Bytes durably written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Destination path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
