//! Uploader facade.
//!
//! Uploads image sequences, prebuilt archives and raw entities one after
//! another, driving a [`TransferLoop`] per entity.

use std::fs::File;
use std::path::{Path, PathBuf};

use geoupload_archive::{ArchivePackager, SequenceGroup, group_sequences, hash_zip_entries};
use geoupload_protocol::constants::IMAGE_DESCRIPTION_FILENAME;
use geoupload_protocol::{FileType, ImageDescription, Progress, UserItem};
use geoupload_transfer::{
    FakeSessionFactory, HttpSessionConfig, HttpSessionFactory, RetryPolicy, SessionFactory,
    SessionRequest, md5sum_file,
};
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::events::EventBus;
use crate::history::UploadHistory;
use crate::stats::StatsCollector;
use crate::transfer_loop::{TransferLoop, TransferState};

/// Configures an [`Uploader`].
pub struct UploaderBuilder {
    user: UserItem,
    factory: Option<Box<dyn SessionFactory>>,
    dry_run: Option<PathBuf>,
    http: HttpSessionConfig,
    events: EventBus,
    policy: RetryPolicy,
    cancel: CancellationToken,
    packager: ArchivePackager,
    history: Option<(UploadHistory, Value)>,
    description_filename: String,
}

impl UploaderBuilder {
    pub fn new(user: UserItem) -> Self {
        Self {
            user,
            factory: None,
            dry_run: None,
            http: HttpSessionConfig::default(),
            events: EventBus::new(),
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            packager: ArchivePackager::default(),
            history: None,
            description_filename: IMAGE_DESCRIPTION_FILENAME.into(),
        }
    }

    /// Applies endpoints, retry limits, the dry-run directory, the upload
    /// history and the description filename from `config`.
    ///
    /// The config itself is recorded as the run parameters of each history
    /// entry.
    pub fn config(mut self, config: &UploaderConfig) -> Self {
        self.http = config.http_config();
        self.policy = config.retry_policy();
        if let Some(dir) = &config.dry_run_dir {
            self.dry_run = Some(dir.clone());
        }
        self.history = config
            .history()
            .map(|history| (history, serde_json::to_value(config).unwrap_or_default()));
        self.description_filename = config.description_filename.clone();
        self
    }

    /// Skips entities recorded in `history` and records finished ones with
    /// `params`. Ignored on dry runs.
    pub fn history(mut self, history: UploadHistory, params: Value) -> Self {
        self.history = Some((history, params));
        self
    }

    /// Description file looked up inside an image directory.
    pub fn description_filename(mut self, name: impl Into<String>) -> Self {
        self.description_filename = name.into();
        self
    }

    /// Writes uploads into `dir` instead of contacting the service.
    pub fn dry_run(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dry_run = Some(dir.into());
        self
    }

    pub fn http_config(mut self, http: HttpSessionConfig) -> Self {
        self.http = http;
        self
    }

    /// Uses `factory` for every session, overriding dry run and HTTP.
    pub fn session_factory(mut self, factory: impl SessionFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn packager(mut self, packager: ArchivePackager) -> Self {
        self.packager = packager;
        self
    }

    /// Validates the user item, picks the session transport and wires the
    /// built-in subscribers.
    ///
    /// Handlers run in this order: history, stats, then the handlers of
    /// [`events`](Self::events).
    pub fn build(self) -> Result<Uploader, UploadError> {
        self.user.validate().map_err(UploadError::User)?;

        let dry_run = self.dry_run.is_some();
        let factory: Box<dyn SessionFactory> = match (self.factory, self.dry_run) {
            (Some(factory), _) => factory,
            (None, Some(dir)) => {
                info!(dir = %dir.display(), "dry run, uploads stay local");
                Box::new(FakeSessionFactory::new(dir))
            }
            (None, None) => Box::new(HttpSessionFactory::new(self.http, &self.user)?),
        };

        let mut events = EventBus::new();
        match self.history {
            Some((history, params)) if !dry_run => history.subscribe(&mut events, params),
            Some(_) => debug!("dry run, upload history disabled"),
            None => {}
        }
        let stats = StatsCollector::new();
        stats.subscribe(&mut events);
        events.append(self.events);

        Ok(Uploader {
            factory,
            events,
            policy: self.policy,
            cancel: self.cancel,
            packager: self.packager,
            stats,
            description_filename: self.description_filename,
        })
    }
}

/// Uploads entities through one session transport.
pub struct Uploader {
    factory: Box<dyn SessionFactory>,
    events: EventBus,
    policy: RetryPolicy,
    cancel: CancellationToken,
    packager: ArchivePackager,
    stats: StatsCollector,
    description_filename: String,
}

impl Uploader {
    pub fn builder(user: UserItem) -> UploaderBuilder {
        UploaderBuilder::new(user)
    }

    /// Subscribers notified of every upload of this uploader.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Returns a token that cancels the current and all later uploads.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stats of every entity this uploader finished.
    pub fn stats(&self) -> &StatsCollector {
        &self.stats
    }

    pub fn description_filename(&self) -> &str {
        &self.description_filename
    }

    /// Uploads each sequence of `descs` as one zipped entity.
    ///
    /// All descriptions are validated before anything is uploaded. A sequence
    /// that fails is logged and left out of the result; the others continue.
    /// Returns sequence key to cluster id for the sequences that finished.
    pub async fn upload_images(
        &mut self,
        descs: Vec<ImageDescription>,
    ) -> Result<IndexMap<String, String>, UploadError> {
        validate_descriptions(&descs)?;

        let groups = group_sequences(descs);
        let total = groups.len();
        let mut clusters = IndexMap::with_capacity(total);

        for (idx, group) in groups.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(remaining = total - idx, "upload cancelled");
                break;
            }
            let progress = Progress::for_sequence(group.key, idx, total, group.len());
            match self.upload_sequence(&group, progress).await {
                Ok(Some(cluster_id)) => {
                    clusters.insert(group.key.to_string(), cluster_id);
                }
                Ok(None) => debug!(sequence = %group.key, "sequence skipped"),
                Err(e) => error!(sequence = %group.key, error = %e, "failed to upload sequence"),
            }
        }

        Ok(clusters)
    }

    /// Uploads a prebuilt zip archive as-is.
    ///
    /// An archive without entries is skipped without contacting the service.
    pub async fn upload_zipfile(&mut self, path: &Path) -> Result<Option<String>, UploadError> {
        let file = open_existing(path)?;
        let packed = hash_zip_entries(&file)?;
        if packed.image_count() == 0 {
            info!(path = %path.display(), "archive has no entries, skipping");
            return Ok(None);
        }

        let mut progress = Progress::single_entity(path);
        progress.md5sum = packed.content_hash.clone();
        progress.sequence_image_count = Some(packed.image_count());
        let item_count = packed.image_count() as u64;
        self.upload_entity(file, FileType::Zip, item_count, TransferState::new(progress))
            .await
    }

    /// Uploads one file (e.g. a video) unmodified as `file_type`.
    pub async fn upload_raw_entity(
        &mut self,
        path: &Path,
        file_type: FileType,
    ) -> Result<Option<String>, UploadError> {
        let file = open_existing(path)?;
        let mut progress = Progress::single_entity(path);
        progress.md5sum = md5sum_file(path)?;
        self.upload_entity(file, file_type, 1, TransferState::new(progress))
            .await
    }

    async fn upload_sequence(
        &mut self,
        group: &SequenceGroup<'_>,
        progress: Progress,
    ) -> Result<Option<String>, UploadError> {
        let (file, packed) = self.packager.pack_to_tempfile(group.descriptions())?;
        let mut progress = progress;
        progress.md5sum = packed.content_hash.clone();
        let state = TransferState::new(progress)
            .with_descriptions(group.descriptions().cloned().collect());
        self.upload_entity(file, FileType::Zip, packed.image_count() as u64, state)
            .await
    }

    async fn upload_entity(
        &mut self,
        file: File,
        file_type: FileType,
        item_count: u64,
        mut state: TransferState,
    ) -> Result<Option<String>, UploadError> {
        let entity_size = file.metadata()?.len();
        let chunk_size = geoupload_transfer::chunk_size(entity_size, item_count);
        let session = self
            .factory
            .open(SessionRequest::new(
                &state.progress.md5sum,
                entity_size,
                file_type,
            ))?;
        debug!(
            session_key = %session.session_key(),
            entity_size,
            chunk_size,
            "opened upload session"
        );

        let outcome = TransferLoop {
            session: session.as_ref(),
            events: &mut self.events,
            policy: self.policy,
            cancel: &self.cancel,
        }
        .run(file, chunk_size, &mut state)
        .await?;
        Ok(outcome.cluster_id())
    }
}

/// Persists one archive per sequence of `descs` into `dir`.
///
/// Returns the archive paths in sequence order.
pub fn zip_images(descs: Vec<ImageDescription>, dir: &Path) -> Result<Vec<PathBuf>, UploadError> {
    validate_descriptions(&descs)?;

    let packager = ArchivePackager::default();
    let groups = group_sequences(descs);
    let mut paths = Vec::with_capacity(groups.len());
    for group in groups.iter() {
        let (path, _) = packager.persist(group.descriptions(), dir)?;
        paths.push(path);
    }
    Ok(paths)
}

pub(crate) fn validate_descriptions(descs: &[ImageDescription]) -> Result<(), UploadError> {
    for desc in descs {
        desc.validate()
            .map_err(|source| UploadError::InvalidDescription {
                filename: desc.filename.clone(),
                source,
            })?;
    }
    Ok(())
}

fn open_existing(path: &Path) -> Result<File, UploadError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => UploadError::NotFound(path.to_path_buf()),
        _ => e.into(),
    })
}
