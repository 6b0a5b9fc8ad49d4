use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::ValidationError;

/// Description keys that identify a photo or sequence rather than describe it.
/// They are never embedded into the packaged image.
const IDENTITY_KEYS: [&str; 2] = ["MAPPhotoUUID", "MAPSequenceUUID"];

/// Compass direction of the camera, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompassHeading {
    #[serde(rename = "TrueHeading")]
    pub true_heading: f64,
    #[serde(rename = "MagneticHeading")]
    pub magnetic_heading: f64,
}

/// Geotag and time metadata of one processed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDescription {
    pub filename: PathBuf,
    #[serde(rename = "MAPLatitude")]
    pub latitude: f64,
    #[serde(rename = "MAPLongitude")]
    pub longitude: f64,
    /// `YYYY_MM_DD_HH_MM_SS_mmm`.
    #[serde(rename = "MAPCaptureTime")]
    pub capture_time: String,
    #[serde(
        rename = "MAPCompassHeading",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub compass_heading: Option<CompassHeading>,
    #[serde(rename = "MAPAltitude", default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(
        rename = "MAPSequenceUUID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sequence_uuid: Option<String>,
    #[serde(rename = "MAPPhotoUUID", default = "new_photo_uuid")]
    pub photo_uuid: String,
    /// Remaining `MAP*` keys (orientation, device make, meta tags...), kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn new_photo_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ImageDescription {
    /// Creates a description with the required fields only.
    pub fn new(
        filename: impl Into<PathBuf>,
        latitude: f64,
        longitude: f64,
        capture_time: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            latitude,
            longitude,
            capture_time: capture_time.into(),
            compass_heading: None,
            altitude: None,
            sequence_uuid: None,
            photo_uuid: new_photo_uuid(),
            extra: Map::new(),
        }
    }

    /// Assigns the sequence grouping key.
    pub fn with_sequence(mut self, sequence_uuid: impl Into<String>) -> Self {
        self.sequence_uuid = Some(sequence_uuid.into());
        self
    }

    /// Parsed capture time.
    pub fn parsed_capture_time(&self) -> Result<NaiveDateTime, ValidationError> {
        parse_capture_time(&self.capture_time)
    }

    /// Checks field values without touching the filesystem.
    pub fn validate_fields(&self) -> Result<(), ValidationError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ValidationError::OutOfRange {
                field: "MAPLatitude",
                value: self.latitude,
            });
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ValidationError::OutOfRange {
                field: "MAPLongitude",
                value: self.longitude,
            });
        }
        self.parsed_capture_time()?;
        if let Some(heading) = &self.compass_heading {
            for (field, value) in [
                ("TrueHeading", heading.true_heading),
                ("MagneticHeading", heading.magnetic_heading),
            ] {
                if !(0.0..360.0).contains(&value) {
                    return Err(ValidationError::OutOfRange { field, value });
                }
            }
        }
        if let Some(altitude) = self.altitude
            && !altitude.is_finite()
        {
            return Err(ValidationError::OutOfRange {
                field: "MAPAltitude",
                value: altitude,
            });
        }
        Ok(())
    }

    /// Full validation: field values plus an existing image file.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.filename.as_os_str().is_empty() {
            return Err(ValidationError::MissingField("filename"));
        }
        self.validate_fields()?;
        if !self.filename.is_file() {
            return Err(ValidationError::ImageNotFound(self.filename.clone()));
        }
        Ok(())
    }

    /// `MAP*` fields to embed into the image, without photo/sequence identity.
    ///
    /// Keys come out sorted, so identical descriptions always serialize to
    /// identical bytes.
    pub fn exif_fields(&self) -> Map<String, Value> {
        let Ok(Value::Object(map)) = serde_json::to_value(self) else {
            return Map::new();
        };
        map.into_iter()
            .filter(|(key, _)| key.starts_with("MAP") && !IDENTITY_KEYS.contains(&key.as_str()))
            .collect()
    }

    /// Returns a copy with `filename` resolved against `dir`.
    pub fn joined_to(&self, dir: &Path) -> Self {
        Self {
            filename: dir.join(&self.filename),
            ..self.clone()
        }
    }
}

/// Record produced for an image the pipeline failed to process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionError {
    #[serde(default)]
    pub filename: PathBuf,
    pub error: Value,
}

/// One entry of a description file.
///
/// The error variant is tried first: a record carrying `error` is an error
/// record even if it also has geotag fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageDescriptionOrError {
    Error(DescriptionError),
    Description(ImageDescription),
}

/// Drops error records, keeping descriptions in their original order.
pub fn filter_out_errors(records: Vec<ImageDescriptionOrError>) -> Vec<ImageDescription> {
    records
        .into_iter()
        .filter_map(|record| match record {
            ImageDescriptionOrError::Description(desc) => Some(desc),
            ImageDescriptionOrError::Error(_) => None,
        })
        .collect()
}

/// Parses `YYYY_MM_DD_HH_MM_SS_mmm`.
pub fn parse_capture_time(value: &str) -> Result<NaiveDateTime, ValidationError> {
    let invalid = || ValidationError::CaptureTime {
        value: value.to_string(),
    };
    let parts = value
        .split('_')
        .map(str::parse::<u32>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    let [year, month, day, hour, minute, second, millis] = parts[..] else {
        return Err(invalid());
    };
    if millis > 999 {
        return Err(invalid());
    }
    NaiveDate::from_ymd_opt(year as i32, month, day)
        .and_then(|date| date.and_hms_milli_opt(hour, minute, second, millis))
        .ok_or_else(invalid)
}

/// Upload credentials for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserItem {
    pub user_upload_token: String,
    #[serde(
        rename = "MAPOrganizationKey",
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub organization_key: Option<String>,
    #[serde(
        rename = "MAPSettingsUserKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_key: Option<String>,
}

impl UserItem {
    /// Creates credentials with only an access token.
    pub fn new(user_upload_token: impl Into<String>) -> Self {
        Self {
            user_upload_token: user_upload_token.into(),
            organization_key: None,
            user_key: None,
        }
    }

    /// Checks the credentials before any operation uses them.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let token = self.user_upload_token.trim();
        if token.is_empty() {
            return Err(ValidationError::UserItem("empty upload token".into()));
        }
        if self.user_upload_token.chars().any(char::is_control) {
            return Err(ValidationError::UserItem(
                "upload token contains control characters".into(),
            ));
        }
        if let Some(org) = &self.organization_key
            && org.trim().is_empty()
        {
            return Err(ValidationError::UserItem("empty organization key".into()));
        }
        Ok(())
    }
}

/// Organization keys show up both as JSON strings and as numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Str(s)) => Some(s),
        Some(Raw::Num(n)) => Some(n.to_string()),
        None => None,
    })
}
