use serde::{Deserialize, Serialize};

/// A slice of the entity read for transfer.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset within the entity.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Number of bytes in the chunk.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    /// Returns `true` for a zero-length chunk.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset just past this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }
}

/// Opaque handle the service returns once every byte has been received.
/// Passed back to `finish`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileHandle(pub String);

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
