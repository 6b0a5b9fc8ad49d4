//! Upload orchestration for geotagged image sequences and videos.
//!
//! [`Uploader`] groups descriptions into sequences, packs each one into a
//! content-addressed archive and drives a resumable [`TransferLoop`] per
//! entity. Progress is published on an [`EventBus`]; [`UploadHistory`] and
//! [`StatsCollector`] are ready-made subscribers.

mod config;
mod error;
mod events;
mod history;
mod import;
mod stats;
mod transfer_loop;
mod uploader;

pub use config::{UploaderConfig, config_path};
pub use error::UploadError;
pub use events::{EventBus, EventError, EventName, UploadEvent};
pub use history::{HistoryRecord, UploadHistory};
pub use import::{
    UploadReport, join_desc_paths, read_image_descriptions, upload_path, upload_paths,
};
pub use stats::{EntityStats, StatsCollector, UploadSummary, log_summary, summarize};
pub use transfer_loop::{TransferLoop, TransferOutcome, TransferState};
pub use uploader::{Uploader, UploaderBuilder, zip_images};
