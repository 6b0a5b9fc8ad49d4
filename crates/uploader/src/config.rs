//! Uploader configuration.
//!
//! Read from `~/.config/geoupload/config.json`, then overridden by
//! `GEOUPLOAD_*` environment variables. Missing or unreadable files fall back
//! to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use geoupload_protocol::constants::{
    IMAGE_DESCRIPTION_FILENAME, MAX_BACKOFF_SECS, MAX_RETRIES,
};
use geoupload_transfer::{HttpSessionConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::UploadError;
use crate::history::UploadHistory;

const ENV_UPLOAD_URL: &str = "GEOUPLOAD_UPLOAD_URL";
const ENV_FINISH_URL: &str = "GEOUPLOAD_FINISH_URL";
const ENV_TIMEOUT_SECS: &str = "GEOUPLOAD_TIMEOUT_SECS";
const ENV_HISTORY_PATH: &str = "GEOUPLOAD_UPLOAD_HISTORY_PATH";
const ENV_DRY_RUN_DIR: &str = "GEOUPLOAD_DRY_RUN_DIR";

/// Settings shared by every upload of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub upload_url: String,
    pub finish_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub max_backoff_secs: u64,
    /// Upload history root. Empty disables the history.
    pub history_dir: String,
    /// When set, uploads go to a local directory instead of the service.
    pub dry_run_dir: Option<PathBuf>,
    /// Description file looked up inside an image directory.
    pub description_filename: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        let http = HttpSessionConfig::default();
        Self {
            upload_url: http.upload_url,
            finish_url: http.finish_url,
            timeout_secs: http.timeout.as_secs(),
            max_retries: MAX_RETRIES,
            max_backoff_secs: MAX_BACKOFF_SECS,
            history_dir: config_base_dir()
                .join("geoupload")
                .join("upload_history")
                .to_string_lossy()
                .into_owned(),
            dry_run_dir: None,
            description_filename: IMAGE_DESCRIPTION_FILENAME.into(),
        }
    }
}

impl UploaderConfig {
    /// Loads the config file and applies environment overrides.
    pub fn load() -> Result<Self, UploadError> {
        let mut config = Self::load_from(&config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when it is missing or invalid.
    pub fn load_from(path: &Path) -> Result<Self, UploadError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse uploader config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Overrides fields from `lookup` (normally the process environment).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_UPLOAD_URL) {
            self.upload_url = url;
        }
        if let Some(url) = lookup(ENV_FINISH_URL) {
            self.finish_url = url;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_SECS) {
            match raw.parse() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {ENV_TIMEOUT_SECS}"),
            }
        }
        // An empty value is meaningful: it disables the history.
        if let Some(dir) = lookup(ENV_HISTORY_PATH) {
            self.history_dir = dir;
        }
        if let Some(dir) = lookup(ENV_DRY_RUN_DIR).filter(|d| !d.is_empty()) {
            self.dry_run_dir = Some(PathBuf::from(dir));
        }
    }

    /// Saves the config as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), UploadError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn http_config(&self) -> HttpSessionConfig {
        HttpSessionConfig {
            upload_url: self.upload_url.clone(),
            finish_url: self.finish_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_delay: Duration::from_secs(self.max_backoff_secs),
        }
    }

    /// The upload history, unless disabled.
    pub fn history(&self) -> Option<UploadHistory> {
        (!self.history_dir.is_empty()).then(|| UploadHistory::new(&self.history_dir))
    }
}

/// Default config file location.
pub fn config_path() -> PathBuf {
    config_base_dir().join("geoupload").join("config.json")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}
