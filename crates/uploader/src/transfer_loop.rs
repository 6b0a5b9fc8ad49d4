//! Resumable transfer state machine.
//!
//! `FETCH_OFFSET → TRANSFER → FINISH`, with every retriable failure in the
//! first two states looping back to `FETCH_OFFSET` after a backoff. The
//! server-reported offset is the only resume point the loop trusts.

use std::fs::File;
use std::ops::ControlFlow;

use geoupload_protocol::{ImageDescription, Progress};
use geoupload_transfer::{ChunkReader, FileHandle, RetryPolicy, SessionError, UploadSession};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UploadError;
use crate::events::{EventBus, EventError, UploadEvent};

/// Mutable state of one entity's upload, shared by the loop and its chunk
/// callback.
#[derive(Debug, Clone, Default)]
pub struct TransferState {
    pub progress: Progress,
    /// Descriptions packed into the entity, reported with `upload_finished`.
    pub descriptions: Vec<ImageDescription>,
}

impl TransferState {
    pub fn new(progress: Progress) -> Self {
        Self {
            progress,
            descriptions: Vec::new(),
        }
    }

    pub fn with_descriptions(mut self, descriptions: Vec<ImageDescription>) -> Self {
        self.descriptions = descriptions;
        self
    }

    /// Consecutive failures since the last acknowledged chunk.
    pub fn retries(&self) -> u32 {
        self.progress.retries
    }

    fn resume_at(&mut self, offset: u64) {
        self.progress.offset = offset;
    }

    fn acknowledge(&mut self, bytes: u64) {
        self.progress.offset += bytes;
        self.progress.chunk_size = bytes;
        self.progress.retries = 0;
    }

    fn record_failure(&mut self) -> u32 {
        self.progress.retries += 1;
        self.progress.retries
    }
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Finished(String),
    Cancelled,
}

impl TransferOutcome {
    pub fn cluster_id(self) -> Option<String> {
        match self {
            TransferOutcome::Finished(id) => Some(id),
            TransferOutcome::Cancelled => None,
        }
    }
}

/// Drives one upload session to completion.
pub struct TransferLoop<'a> {
    pub session: &'a dyn UploadSession,
    pub events: &'a mut EventBus,
    pub policy: RetryPolicy,
    pub cancel: &'a CancellationToken,
}

/// Result of emitting an event that may stop the loop.
enum Emitted {
    Continue,
    Cancelled,
}

fn emitted(result: Result<(), EventError>) -> Result<Emitted, UploadError> {
    match result {
        Ok(()) => Ok(Emitted::Continue),
        Err(EventError::Cancelled) => Ok(Emitted::Cancelled),
        Err(EventError::Failed(msg)) => Err(UploadError::Subscriber(msg)),
    }
}

impl TransferLoop<'_> {
    /// Uploads `file` in chunks of `chunk_size` bytes.
    ///
    /// `state.progress` is updated in place and passed to every event.
    /// Cancellation (token or subscriber) returns `Ok(Cancelled)`.
    pub async fn run(
        &mut self,
        file: File,
        chunk_size: u64,
        state: &mut TransferState,
    ) -> Result<TransferOutcome, UploadError> {
        state.progress.entity_size = self.session.entity_size();
        state.progress.chunk_size = chunk_size;

        if let Emitted::Cancelled = emitted(self.events.emit(&UploadEvent::Start {
            progress: &state.progress,
        }))? {
            info!(session_key = %self.session.session_key(), "upload cancelled before start");
            return Ok(TransferOutcome::Cancelled);
        }

        let mut reader = ChunkReader::new(file, chunk_size)?;
        let handle = loop {
            if self.cancel.is_cancelled() {
                return Ok(TransferOutcome::Cancelled);
            }
            match self.attempt(&mut reader, state).await? {
                Attempt::Done(handle) => break handle,
                Attempt::Cancelled => return Ok(TransferOutcome::Cancelled),
                Attempt::Failed(err) => {
                    if !self.back_off(err, state).await? {
                        return Ok(TransferOutcome::Cancelled);
                    }
                }
            }
        };

        if let Emitted::Cancelled = emitted(self.events.emit(&UploadEvent::End {
            progress: &state.progress,
        }))? {
            return Ok(TransferOutcome::Cancelled);
        }
        if self.cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled);
        }

        let cluster_id = self
            .session
            .finish(&handle)
            .await
            .map_err(UploadError::Finish)?;
        state.progress.cluster_id = Some(cluster_id.clone());
        info!(
            session_key = %self.session.session_key(),
            cluster_id = %cluster_id,
            "upload finished"
        );

        // The service already holds the upload; a late cancel has nothing to stop.
        match self.events.emit(&UploadEvent::Finished {
            cluster_id: &cluster_id,
            descriptions: &state.descriptions,
            progress: &state.progress,
        }) {
            Ok(()) | Err(EventError::Cancelled) => {}
            Err(EventError::Failed(msg)) => return Err(UploadError::Subscriber(msg)),
        }

        Ok(TransferOutcome::Finished(cluster_id))
    }

    /// One pass of FETCH_OFFSET followed by TRANSFER.
    async fn attempt(
        &mut self,
        reader: &mut ChunkReader,
        state: &mut TransferState,
    ) -> Result<Attempt, UploadError> {
        let offset = match self.session.fetch_offset().await {
            Ok(offset) => offset,
            Err(e) => return Ok(Attempt::Failed(e)),
        };
        let entity_size = self.session.entity_size();
        if offset > entity_size {
            return Err(UploadError::Session(SessionError::Protocol(format!(
                "server offset {offset} beyond entity size {entity_size}"
            ))));
        }

        state.resume_at(offset);
        debug!(
            session_key = %self.session.session_key(),
            offset,
            retries = state.retries(),
            "resuming from server offset"
        );
        if let Emitted::Cancelled = emitted(self.events.emit(&UploadEvent::FetchOffset {
            offset,
            progress: &state.progress,
        }))? {
            return Ok(Attempt::Cancelled);
        }

        let mut stop: Option<EventError> = None;
        let events = &mut *self.events;
        let cancel = self.cancel;
        let mut on_chunk = |bytes: u64| {
            state.acknowledge(bytes);
            if let Err(e) = events.emit(&UploadEvent::Progress {
                chunk_size: bytes,
                progress: &state.progress,
            }) {
                stop = Some(e);
                return ControlFlow::Break(());
            }
            if cancel.is_cancelled() {
                stop = Some(EventError::Cancelled);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        };

        let result = self.session.transfer(reader, offset, &mut on_chunk).await;
        match result {
            Ok(Some(handle)) => Ok(Attempt::Done(handle)),
            Ok(None) => match stop {
                Some(EventError::Failed(msg)) => Err(UploadError::Subscriber(msg)),
                Some(EventError::Cancelled) | None => Ok(Attempt::Cancelled),
            },
            Err(e) => Ok(Attempt::Failed(e)),
        }
    }

    /// Classifies `err` and waits before the next attempt.
    ///
    /// Returns `false` if the run was cancelled while waiting.
    async fn back_off(
        &mut self,
        err: SessionError,
        state: &mut TransferState,
    ) -> Result<bool, UploadError> {
        if !err.is_retriable() {
            return Err(UploadError::Session(err));
        }

        let retries = state.record_failure();
        if self.policy.exhausted(retries) {
            return Err(UploadError::RetriesExhausted {
                retries,
                source: err,
            });
        }

        let delay = self.policy.delay_for_retry(retries);
        warn!(
            session_key = %self.session.session_key(),
            chunk_size = state.progress.chunk_size,
            offset = state.progress.offset,
            error = %err,
            "upload interrupted"
        );
        info!(
            delay_secs = delay.as_secs(),
            retries,
            max_retries = self.policy.max_retries,
            "retrying"
        );

        if let Emitted::Cancelled = emitted(self.events.emit(&UploadEvent::Interrupted {
            retries,
            delay,
            reason: &err,
            progress: &state.progress,
        }))? {
            return Ok(false);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }
}

enum Attempt {
    Done(FileHandle),
    Cancelled,
    Failed(SessionError),
}
