//! Embedding of description fields into image metadata.

use std::io::Cursor;

use exif::experimental::Writer;
use exif::{Field, In, Tag, Value};
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::{Bytes, ImageEXIF};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::PackError;

/// Writes description fields into an image's bytes.
pub trait MetadataEditor: Send + Sync {
    /// Returns `image` with `fields` embedded. Must be deterministic.
    fn embed(&self, image: &[u8], fields: &Map<String, JsonValue>) -> Result<Vec<u8>, PackError>;
}

/// Stores the fields as JSON in the EXIF `ImageDescription` tag.
///
/// JPEG and PNG images keep the other primary-IFD fields of their existing
/// EXIF block, and its JPEG thumbnail. Any other format is returned
/// unchanged. Images too truncated to hold an EXIF block fail with
/// [`PackError::UnsupportedImage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifDescriptionEditor;

impl MetadataEditor for ExifDescriptionEditor {
    fn embed(&self, image: &[u8], fields: &Map<String, JsonValue>) -> Result<Vec<u8>, PackError> {
        let description = serde_json::to_string(fields)?;

        if let Ok(mut jpeg) = Jpeg::from_bytes(Bytes::copy_from_slice(image)) {
            let exif = description_exif(jpeg.exif().as_deref(), &description)?;
            jpeg.set_exif(None);
            if jpeg.segments().len() < JPEG_EXIF_INDEX {
                return Err(PackError::UnsupportedImage(format!(
                    "JPEG with {} segments",
                    jpeg.segments().len()
                )));
            }
            jpeg.set_exif(Some(exif.into()));
            return Ok(jpeg.encoder().bytes().to_vec());
        }

        if let Ok(mut png) = Png::from_bytes(Bytes::copy_from_slice(image)) {
            let exif = description_exif(png.exif().as_deref(), &description)?;
            png.set_exif(None);
            if png.chunks().is_empty() {
                return Err(PackError::UnsupportedImage("PNG without chunks".into()));
            }
            png.set_exif(Some(exif.into()));
            return Ok(png.encoder().bytes().to_vec());
        }

        debug!(len = image.len(), "not a JPEG or PNG, leaving metadata untouched");
        Ok(image.to_vec())
    }
}

/// Segment index img-parts inserts the EXIF block at.
const JPEG_EXIF_INDEX: usize = 3;

/// Tags the writer derives itself or that point at data we do not carry over.
const SKIPPED_TAGS: [Tag; 10] = [
    Tag::ImageDescription,
    Tag::ExifIFDPointer,
    Tag::GPSInfoIFDPointer,
    Tag::InteropIFDPointer,
    Tag::JPEGInterchangeFormat,
    Tag::JPEGInterchangeFormatLength,
    Tag::StripOffsets,
    Tag::StripByteCounts,
    Tag::TileOffsets,
    Tag::TileByteCounts,
];

fn carried_over(field: &Field) -> bool {
    (field.ifd_num == In::PRIMARY || field.ifd_num == In::THUMBNAIL)
        && !SKIPPED_TAGS.contains(&field.tag)
        && !matches!(field.value, Value::Unknown(..))
}

/// JPEG thumbnail stored in IFD1, if any.
fn thumbnail_jpeg(exif: &exif::Exif) -> Option<&[u8]> {
    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    let len = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)?
        .value
        .get_uint(0)? as usize;
    exif.buf().get(offset..offset.checked_add(len)?)
}

/// Builds a little-endian TIFF block holding `description` plus the
/// carried-over primary and thumbnail fields of `existing`. A JPEG thumbnail
/// is kept; strip or tile thumbnails are dropped.
fn description_exif(existing: Option<&[u8]>, description: &str) -> Result<Vec<u8>, PackError> {
    let parsed = existing.and_then(|raw| match exif::Reader::new().read_raw(raw.to_vec()) {
        Ok(exif) => Some(exif),
        Err(e) => {
            debug!(error = %e, "discarding unreadable EXIF block");
            None
        }
    });

    let description_field = Field {
        tag: Tag::ImageDescription,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![description.as_bytes().to_vec()]),
    };

    let mut writer = Writer::new();
    writer.push_field(&description_field);
    if let Some(exif) = &parsed {
        for field in exif.fields().filter(|f| carried_over(f)) {
            writer.push_field(field);
        }
        if let Some(thumbnail) = thumbnail_jpeg(exif) {
            writer.set_jpeg(thumbnail, In::THUMBNAIL);
        }
    }

    let mut buf = Cursor::new(Vec::new());
    writer.write(&mut buf, true)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("MAPLatitude".into(), JsonValue::from(52.5));
        map.insert("MAPCaptureTime".into(), "2021_01_01_00_00_00_000".into());
        map
    }

    fn read_description(block: &[u8]) -> String {
        let exif = exif::Reader::new().read_raw(block.to_vec()).unwrap();
        let field = exif.get_field(Tag::ImageDescription, In::PRIMARY).unwrap();
        match &field.value {
            Value::Ascii(parts) => String::from_utf8(parts[0].clone()).unwrap(),
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn description_block_roundtrips_through_reader() {
        let json = serde_json::to_string(&fields()).unwrap();
        let block = description_exif(None, &json).unwrap();
        assert_eq!(read_description(&block), json);
    }

    #[test]
    fn existing_primary_fields_are_kept() {
        let make = Field {
            tag: Tag::Make,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"Cam".to_vec()]),
        };
        let old_desc = Field {
            tag: Tag::ImageDescription,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"old".to_vec()]),
        };
        let mut writer = Writer::new();
        writer.push_field(&make);
        writer.push_field(&old_desc);
        let mut buf = Cursor::new(Vec::new());
        writer.write(&mut buf, false).unwrap();

        let block = description_exif(Some(buf.get_ref()), "{}").unwrap();
        let exif = exif::Reader::new().read_raw(block.clone()).unwrap();
        assert!(exif.get_field(Tag::Make, In::PRIMARY).is_some());
        assert_eq!(read_description(&block), "{}");
    }

    #[test]
    fn unreadable_existing_block_is_replaced() {
        let block = description_exif(Some(b"garbage"), "{}").unwrap();
        assert_eq!(read_description(&block), "{}");
    }

    #[test]
    fn other_formats_pass_through() {
        let data = b"not an image at all";
        let out = ExifDescriptionEditor.embed(data, &fields()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn jpeg_thumbnail_is_kept() {
        let make = Field {
            tag: Tag::Make,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![b"Cam".to_vec()]),
        };
        let mut writer = Writer::new();
        writer.push_field(&make);
        writer.set_jpeg(b"THUMBNAIL", In::THUMBNAIL);
        let mut buf = Cursor::new(Vec::new());
        writer.write(&mut buf, false).unwrap();

        let block = description_exif(Some(buf.get_ref()), "{}").unwrap();
        let exif = exif::Reader::new().read_raw(block.clone()).unwrap();
        assert_eq!(thumbnail_jpeg(&exif), Some(&b"THUMBNAIL"[..]));
        assert_eq!(read_description(&block), "{}");
    }

    #[test]
    fn png_without_chunks_is_rejected() {
        let png = b"\x89PNG\r\n\x1a\n";
        let err = ExifDescriptionEditor.embed(png, &fields()).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedImage(_)));
    }

    #[test]
    fn truncated_jpeg_is_rejected() {
        // SOI, an empty APP1 Exif segment, then SOS with one byte of scan data.
        let jpeg = b"\xff\xd8\xff\xe1\x00\x08Exif\x00\x00\xff\xda\x00\x08\x01\x01\x00\x00\x3f\x00\x00";
        let err = ExifDescriptionEditor.embed(jpeg, &fields()).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedImage(_)));
    }

    #[test]
    fn embedding_is_deterministic() {
        let a = description_exif(None, "{\"a\":1}").unwrap();
        let b = description_exif(None, "{\"a\":1}").unwrap();
        assert_eq!(a, b);
    }
}
