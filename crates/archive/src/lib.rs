//! Packaging of image sequences into deterministic archives.
//!
//! [`group_sequences`] partitions descriptions by sequence identity;
//! [`ArchivePackager`] turns one sequence into a zip whose entry names and
//! fingerprint depend only on image content.

mod grouper;
mod metadata;
mod packager;

pub use grouper::{SequenceGroup, SequenceGroups, group_sequences};
pub use metadata::{ExifDescriptionEditor, MetadataEditor};
pub use packager::{ArchivePackager, PackedArchive, archive_file_name, hash_zip_entries};

use std::path::PathBuf;

use geoupload_protocol::ValidationError;

/// Errors produced while packaging a sequence.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid description for {}: {source}", filename.display())]
    Invalid {
        filename: PathBuf,
        #[source]
        source: ValidationError,
    },

    #[error("unsupported image: {0}")]
    UnsupportedImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("EXIF error: {0}")]
    Exif(#[from] exif::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
