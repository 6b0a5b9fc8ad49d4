//! Deterministic zip packaging of one sequence.
//!
//! Entry names are the MD5 of the original image bytes plus the lower-cased
//! extension, entries carry a constant timestamp, and the archive fingerprint
//! is the MD5 of the concatenated entry stems. Re-packaging the same images
//! therefore yields the same bytes and the same fingerprint.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use geoupload_protocol::ImageDescription;
use geoupload_protocol::constants::ARCHIVE_PREFIX;
use geoupload_transfer::md5sum_bytes;
use tracing::{debug, info};
use zip::write::{FileOptions, ZipWriter};
use zip::{CompressionMethod, DateTime, ZipArchive};

use crate::PackError;
use crate::metadata::{ExifDescriptionEditor, MetadataEditor};

/// Result of packing a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    /// Fingerprint used for naming and as the session key stem.
    pub content_hash: String,
    /// Entry names in archive order.
    pub entry_names: Vec<String>,
}

impl PackedArchive {
    fn from_entry_names(entry_names: Vec<String>) -> Self {
        let stems: String = entry_names.iter().map(|name| entry_stem(name)).collect();
        Self {
            content_hash: md5sum_bytes(stems.as_bytes()),
            entry_names,
        }
    }

    pub fn image_count(&self) -> usize {
        self.entry_names.len()
    }
}

/// File name of a persisted archive: `archive-<content_hash>.zip`.
pub fn archive_file_name(content_hash: &str) -> String {
    format!("{ARCHIVE_PREFIX}-{content_hash}.zip")
}

fn entry_stem(name: &str) -> &str {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    match base.rfind('.') {
        Some(0) | None => base,
        Some(dot) => &base[..dot],
    }
}

fn entry_name(md5sum: &str, filename: &Path) -> String {
    match filename.extension() {
        Some(ext) => format!("{md5sum}.{}", ext.to_string_lossy().to_lowercase()),
        None => md5sum.to_string(),
    }
}

/// Fingerprints a prebuilt archive from its entry names, in archive order.
pub fn hash_zip_entries<R: Read + Seek>(reader: R) -> Result<PackedArchive, PackError> {
    let mut archive = ZipArchive::new(reader)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        names.push(archive.by_index(i)?.name().to_string());
    }
    Ok(PackedArchive::from_entry_names(names))
}

/// Builds archives for image sequences.
pub struct ArchivePackager {
    editor: Box<dyn MetadataEditor>,
}

impl Default for ArchivePackager {
    fn default() -> Self {
        Self::new(ExifDescriptionEditor)
    }
}

impl ArchivePackager {
    pub fn new(editor: impl MetadataEditor + 'static) -> Self {
        Self {
            editor: Box::new(editor),
        }
    }

    /// Writes the sequence as a zip into `writer`.
    ///
    /// Every description is validated first; one invalid record fails the
    /// whole sequence before anything is written.
    pub fn pack<'a, W: Write + Seek>(
        &self,
        descriptions: impl IntoIterator<Item = &'a ImageDescription>,
        writer: W,
    ) -> Result<PackedArchive, PackError> {
        let mut ordered = Vec::new();
        for desc in descriptions {
            let invalid = |source| PackError::Invalid {
                filename: desc.filename.clone(),
                source,
            };
            desc.validate().map_err(invalid)?;
            let captured = desc.parsed_capture_time().map_err(invalid)?;
            ordered.push((captured, desc));
        }
        ordered.sort_by(|(ta, a), (tb, b)| ta.cmp(tb).then_with(|| a.filename.cmp(&b.filename)));

        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(0o644);

        let mut zip = ZipWriter::new(writer);
        let mut entry_names = Vec::with_capacity(ordered.len());
        for (_, desc) in ordered {
            let original = std::fs::read(&desc.filename)?;
            let name = entry_name(&md5sum_bytes(&original), &desc.filename);
            let edited = self.editor.embed(&original, &desc.exif_fields())?;

            zip.start_file(name.as_str(), options)?;
            zip.write_all(&edited)?;
            debug!(entry = %name, source = %desc.filename.display(), "added archive entry");
            entry_names.push(name);
        }
        zip.finish()?;

        Ok(PackedArchive::from_entry_names(entry_names))
    }

    /// Packs into an anonymous temporary file, rewound to the start.
    ///
    /// The file is removed by the OS as soon as it is dropped.
    pub fn pack_to_tempfile<'a>(
        &self,
        descriptions: impl IntoIterator<Item = &'a ImageDescription>,
    ) -> Result<(File, PackedArchive), PackError> {
        let mut file = tempfile::tempfile()?;
        let packed = self.pack(descriptions, &mut file)?;
        file.seek(SeekFrom::Start(0))?;
        Ok((file, packed))
    }

    /// Packs into `dir` as `archive-<content_hash>.zip`.
    ///
    /// The archive is written under a temporary name and renamed only once
    /// complete; a failed pack leaves nothing behind.
    pub fn persist<'a>(
        &self,
        descriptions: impl IntoIterator<Item = &'a ImageDescription>,
        dir: &Path,
    ) -> Result<(PathBuf, PackedArchive), PackError> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(ARCHIVE_PREFIX)
            .suffix(".wip")
            .tempfile_in(dir)?;
        let packed = self.pack(descriptions, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;

        let path = dir.join(archive_file_name(&packed.content_hash));
        tmp.persist(&path).map_err(|e| e.error)?;
        info!(path = %path.display(), images = packed.image_count(), "archive written");
        Ok((path, packed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn image(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn desc(path: &Path, time: &str) -> ImageDescription {
        ImageDescription::new(path, 48.0, 11.0, time).with_sequence("seq")
    }

    fn sample(dir: &Path) -> Vec<ImageDescription> {
        vec![
            desc(&image(dir, "b.JPG", b"image b"), "2021_01_01_00_00_02_000"),
            desc(&image(dir, "a.jpg", b"image a"), "2021_01_01_00_00_01_000"),
            desc(&image(dir, "c.jpg", b"image c"), "2021_01_01_00_00_02_000"),
        ]
    }

    fn pack_bytes(packager: &ArchivePackager, descs: &[ImageDescription]) -> (Vec<u8>, PackedArchive) {
        let mut buf = Vec::new();
        let packed = packager.pack(descs, Cursor::new(&mut buf)).unwrap();
        (buf, packed)
    }

    #[test]
    fn entries_are_named_by_content_and_sorted() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let (_, packed) = pack_bytes(&ArchivePackager::default(), &descs);

        // a (t=1), then b and c at t=2 tie-broken by filename.
        assert_eq!(
            packed.entry_names,
            vec![
                format!("{}.jpg", md5sum_bytes(b"image a")),
                format!("{}.jpg", md5sum_bytes(b"image b")),
                format!("{}.jpg", md5sum_bytes(b"image c")),
            ]
        );
        let stems = format!(
            "{}{}{}",
            md5sum_bytes(b"image a"),
            md5sum_bytes(b"image b"),
            md5sum_bytes(b"image c")
        );
        assert_eq!(packed.content_hash, md5sum_bytes(stems.as_bytes()));
    }

    #[test]
    fn packing_is_deterministic_across_input_order() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let mut reversed = descs.clone();
        reversed.reverse();

        let packager = ArchivePackager::default();
        let (bytes1, packed1) = pack_bytes(&packager, &descs);
        let (bytes2, packed2) = pack_bytes(&packager, &reversed);
        assert_eq!(bytes1, bytes2);
        assert_eq!(packed1, packed2);
    }

    #[test]
    fn prebuilt_archive_hash_matches_packed_hash() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let (bytes, packed) = pack_bytes(&ArchivePackager::default(), &descs);
        let rehashed = hash_zip_entries(Cursor::new(bytes)).unwrap();
        assert_eq!(rehashed, packed);
    }

    #[test]
    fn entries_carry_constant_timestamp() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let (bytes, _) = pack_bytes(&ArchivePackager::default(), &descs);
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        for i in 0..archive.len() {
            let entry = archive.by_index(i).unwrap();
            let t = entry.last_modified();
            assert_eq!((t.year(), t.month(), t.day()), (1980, 1, 1));
            assert_eq!((t.hour(), t.minute(), t.second()), (0, 0, 0));
        }
    }

    #[test]
    fn missing_image_fails_whole_sequence() {
        let dir = TempDir::new().unwrap();
        let mut descs = sample(dir.path());
        descs.push(desc(&dir.path().join("gone.jpg"), "2021_01_01_00_00_03_000"));

        let mut buf = Vec::new();
        let err = ArchivePackager::default()
            .pack(&descs, Cursor::new(&mut buf))
            .unwrap_err();
        assert!(matches!(err, PackError::Invalid { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn persist_renames_to_content_hash() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let out = dir.path().join("zips");

        let (path, packed) = ArchivePackager::default().persist(&descs, &out).unwrap();
        assert_eq!(path, out.join(format!("archive-{}.zip", packed.content_hash)));

        let names: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1, "no temporary file may remain: {names:?}");
    }

    #[test]
    fn tempfile_is_rewound() {
        let dir = TempDir::new().unwrap();
        let descs = sample(dir.path());
        let (file, packed) = ArchivePackager::default().pack_to_tempfile(&descs).unwrap();
        assert_eq!(hash_zip_entries(file).unwrap(), packed);
    }

    #[test]
    fn entry_stem_strips_extension_only() {
        assert_eq!(entry_stem("abc.jpg"), "abc");
        assert_eq!(entry_stem("dir/abc.tar.gz"), "abc.tar");
        assert_eq!(entry_stem("abc"), "abc");
    }
}
