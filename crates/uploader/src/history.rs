//! Local record of finished uploads, keyed by content fingerprint.
//!
//! Layout: `<root>/<md5[..2]>/<md5[2..]>.json`. An entity whose fingerprint
//! is on record is skipped on the next run.

use std::io::Write;
use std::path::{Path, PathBuf};

use geoupload_protocol::{ImageDescription, Progress};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::events::{EventBus, EventError, EventName, UploadEvent};

/// One history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Parameters of the run that produced the upload.
    pub params: Value,
    /// Final progress payload, including the cluster id.
    pub summary: Progress,
    /// The sequence's descriptions, when the entity was built from images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descs: Option<Vec<ImageDescription>>,
}

/// Upload history rooted at a directory.
#[derive(Debug, Clone)]
pub struct UploadHistory {
    root: PathBuf,
}

impl UploadHistory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// History file for `md5sum`.
    pub fn path_for(&self, md5sum: &str) -> Result<PathBuf, UploadError> {
        if md5sum.len() < 4 || !md5sum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UploadError::InvalidFingerprint(md5sum.to_string()));
        }
        let (subfolder, basename) = md5sum.split_at(2);
        Ok(self.root.join(subfolder).join(format!("{basename}.json")))
    }

    pub fn is_uploaded(&self, md5sum: &str) -> bool {
        self.path_for(md5sum).is_ok_and(|p| p.is_file())
    }

    /// Writes the record atomically.
    pub fn write(&self, md5sum: &str, record: &HistoryRecord) -> Result<PathBuf, UploadError> {
        let path = self.path_for(md5sum)?;
        let dir = path
            .parent()
            .ok_or_else(|| UploadError::InvalidFingerprint(md5sum.to_string()))?;
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec(record)?)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "wrote upload history");
        Ok(path)
    }

    pub fn read(&self, md5sum: &str) -> Result<HistoryRecord, UploadError> {
        let content = std::fs::read(self.path_for(md5sum)?)?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Registers the duplicate check and the history writer on `events`.
    ///
    /// The check cancels entities already on record at `upload_start`; it
    /// should be registered before other subscribers. Write failures are only
    /// logged.
    pub fn subscribe(&self, events: &mut EventBus, params: Value) {
        let history = self.clone();
        events.on(EventName::Start, move |event| {
            let progress = event.progress();
            if history.is_uploaded(&progress.md5sum) {
                match &progress.sequence_uuid {
                    Some(seq) => info!(sequence = %seq, "sequence has been uploaded already"),
                    None => info!(
                        path = ?progress.import_path,
                        "file has been uploaded already"
                    ),
                }
                return Err(EventError::Cancelled);
            }
            Ok(())
        });

        let history = self.clone();
        events.on(EventName::Finished, move |event| {
            let UploadEvent::Finished {
                descriptions,
                progress,
                ..
            } = event
            else {
                return Ok(());
            };
            let record = HistoryRecord {
                params: params.clone(),
                summary: (*progress).clone(),
                descs: sorted_descs(descriptions),
            };
            if let Err(e) = history.write(&progress.md5sum, &record) {
                warn!(md5sum = %progress.md5sum, error = %e, "failed to write upload history");
            }
            Ok(())
        });
    }
}

/// The finished sequence's descriptions, ordered by capture time.
fn sorted_descs(descriptions: &[ImageDescription]) -> Option<Vec<ImageDescription>> {
    if descriptions.is_empty() {
        return None;
    }
    let mut sequence = descriptions.to_vec();
    sequence.sort_by_key(|d| d.parsed_capture_time().ok());
    Some(sequence)
}
