//! Reading description files and dispatching an import path to the right
//! upload operation.

use std::path::{Path, PathBuf};

use geoupload_protocol::{FileType, ImageDescription, ImageDescriptionOrError, filter_out_errors};
use indexmap::IndexMap;
use tracing::info;

use crate::error::UploadError;
use crate::stats::{UploadSummary, log_summary, summarize};
use crate::uploader::{Uploader, validate_descriptions};

/// Reads a JSON array of descriptions, dropping error records.
pub fn read_image_descriptions(path: &Path) -> Result<Vec<ImageDescription>, UploadError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(UploadError::NotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    let records: Vec<ImageDescriptionOrError> = serde_json::from_slice(&content)?;
    let total = records.len();
    let descs = filter_out_errors(records);
    if descs.len() < total {
        info!(
            path = %path.display(),
            skipped = total - descs.len(),
            "skipping images that failed processing"
        );
    }
    Ok(descs)
}

/// Resolves relative image filenames against `dir`.
pub fn join_desc_paths(dir: &Path, descs: Vec<ImageDescription>) -> Vec<ImageDescription> {
    descs.iter().map(|d| d.joined_to(dir)).collect()
}

/// What an import path turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ImportKind {
    Zip,
    Video,
    Images { desc_path: PathBuf },
}

fn classify(
    path: &Path,
    desc_path: Option<&Path>,
    description_filename: &str,
) -> Result<ImportKind, UploadError> {
    if path.is_dir() {
        let desc_path = desc_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.join(description_filename));
        if !desc_path.is_file() {
            return Err(UploadError::NotFound(desc_path));
        }
        return Ok(ImportKind::Images { desc_path });
    }
    if !path.is_file() {
        return Err(UploadError::NotFound(path.to_path_buf()));
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "zip" => Ok(ImportKind::Zip),
        "mp4" => Ok(ImportKind::Video),
        _ => Err(UploadError::UnsupportedFileType(path.to_path_buf())),
    }
}

/// A checked import path, ready to upload.
enum Import<'a> {
    Zip(&'a Path),
    Video(&'a Path),
    Images(Vec<ImageDescription>),
}

fn prepare<'a>(
    path: &'a Path,
    desc_path: Option<&Path>,
    description_filename: &str,
) -> Result<Import<'a>, UploadError> {
    match classify(path, desc_path, description_filename)? {
        ImportKind::Zip => Ok(Import::Zip(path)),
        ImportKind::Video => Ok(Import::Video(path)),
        ImportKind::Images { desc_path } => {
            let descs = join_desc_paths(path, read_image_descriptions(&desc_path)?);
            validate_descriptions(&descs)?;
            Ok(Import::Images(descs))
        }
    }
}

async fn upload_prepared(
    uploader: &mut Uploader,
    import: Import<'_>,
) -> Result<IndexMap<String, String>, UploadError> {
    let single = |path: &Path, cluster_id: Option<String>| -> IndexMap<String, String> {
        cluster_id
            .map(|id| (path.display().to_string(), id))
            .into_iter()
            .collect()
    };

    match import {
        Import::Zip(path) => Ok(single(path, uploader.upload_zipfile(path).await?)),
        Import::Video(path) => Ok(single(
            path,
            uploader.upload_raw_entity(path, FileType::RawVideo).await?,
        )),
        Import::Images(descs) => uploader.upload_images(descs).await,
    }
}

/// Uploads whatever `path` holds.
///
/// A `.zip` file is uploaded as a prebuilt archive, an `.mp4` file as a raw
/// video, and a directory through its description file (`desc_path`, or the
/// uploader's description filename inside it). The path and its descriptions
/// are checked before anything is uploaded.
///
/// Returns sequence key (or the file path for single files) to cluster id.
pub async fn upload_path(
    uploader: &mut Uploader,
    path: &Path,
    desc_path: Option<&Path>,
) -> Result<IndexMap<String, String>, UploadError> {
    let import = prepare(path, desc_path, uploader.description_filename())?;
    upload_prepared(uploader, import).await
}

/// Result of [`upload_paths`].
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    /// Sequence key (or file path) to cluster id, in upload order.
    pub clusters: IndexMap<String, String>,
    /// Entities finished by this call.
    pub summary: UploadSummary,
}

/// Uploads every path in `paths`, in order, and logs a summary.
///
/// Every path is checked before the first upload starts, so one bad path
/// uploads nothing. `desc_path` overrides the description file of every
/// image directory.
pub async fn upload_paths(
    uploader: &mut Uploader,
    paths: &[PathBuf],
    desc_path: Option<&Path>,
) -> Result<UploadReport, UploadError> {
    let description_filename = uploader.description_filename().to_string();
    let imports = paths
        .iter()
        .map(|path| prepare(path, desc_path, &description_filename))
        .collect::<Result<Vec<_>, _>>()?;

    let already_finished = uploader.stats().stats().len();
    let mut clusters = IndexMap::new();
    for import in imports {
        clusters.extend(upload_prepared(uploader, import).await?);
    }

    let finished = uploader.stats().stats();
    let summary = summarize(finished.get(already_finished..).unwrap_or_default());
    if summary.sequences == 0 {
        info!("Nothing uploaded. Bye.");
    } else {
        log_summary(&summary);
    }
    Ok(UploadReport { clusters, summary })
}
