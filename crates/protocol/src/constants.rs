use serde::{Deserialize, Serialize};

/// Lower bound for a transfer chunk (1 MiB).
pub const MIN_CHUNK_SIZE: u64 = 1024 * 1024;

/// Upper bound for a transfer chunk (16 MiB).
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Consecutive retriable failures tolerated before an upload is abandoned.
pub const MAX_RETRIES: u32 = 200;

/// Cap on the backoff delay between retries, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 16;

/// Prefix of every remote session key.
pub const SESSION_KEY_PREFIX: &str = "geoupload";

/// Prefix of archives persisted to disk.
pub const ARCHIVE_PREFIX: &str = "archive";

/// Default name of the description file inside an image directory.
pub const IMAGE_DESCRIPTION_FILENAME: &str = "image_description.json";

/// Kind of entity sent to the ingestion service.
///
/// Serialized values are the discriminators the service expects in the
/// finish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Zipped image sequence.
    #[serde(rename = "zip")]
    Zip,
    /// Dash-cam video uploaded as a single raw entity.
    #[serde(rename = "raw_video")]
    RawVideo,
}

impl FileType {
    /// Discriminator sent with the finish request.
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Zip => "zip",
            FileType::RawVideo => "raw_video",
        }
    }

    /// File extension used as the session key suffix.
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Zip => "zip",
            FileType::RawVideo => "mp4",
        }
    }

    /// MIME type announced while streaming the entity.
    pub fn content_type(self) -> &'static str {
        match self {
            FileType::Zip => "application/zip",
            FileType::RawVideo => "video/mp4",
        }
    }

    /// Builds the remote session key for an entity fingerprint.
    pub fn session_key(self, md5sum: &str) -> String {
        format!("{SESSION_KEY_PREFIX}_{md5sum}.{}", self.extension())
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
