//! Data contract between the geotagging pipeline and the uploader.
//!
//! Everything the upload engine consumes arrives as an [`ImageDescription`]
//! (or an error record that gets filtered out), together with the
//! [`UserItem`] credentials for the run.

pub mod constants;
pub mod progress;
pub mod types;

pub use constants::FileType;
pub use progress::Progress;
pub use types::{
    CompassHeading, DescriptionError, ImageDescription, ImageDescriptionOrError, UserItem,
    filter_out_errors, parse_capture_time,
};

use std::path::PathBuf;

/// Errors produced while validating descriptions and credentials.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("invalid capture time {value:?}: expected YYYY_MM_DD_HH_MM_SS_mmm")]
    CaptureTime { value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid user item: {0}")]
    UserItem(String),
}
