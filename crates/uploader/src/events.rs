//! Synchronous publish/subscribe for upload lifecycle events.
//!
//! Handlers run in registration order inside the emitting call. The first
//! handler that returns an error stops delivery and aborts the emitting
//! operation; [`EventError::Cancelled`] turns that abort into a cancellation.

use std::fmt;
use std::time::Duration;

use geoupload_protocol::{ImageDescription, Progress};
use geoupload_transfer::SessionError;

/// Closed set of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Start,
    FetchOffset,
    Progress,
    End,
    Finished,
    Interrupted,
}

impl EventName {
    pub const ALL: [EventName; 6] = [
        EventName::Start,
        EventName::FetchOffset,
        EventName::Progress,
        EventName::End,
        EventName::Finished,
        EventName::Interrupted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Start => "upload_start",
            EventName::FetchOffset => "upload_fetch_offset",
            EventName::Progress => "upload_progress",
            EventName::End => "upload_end",
            EventName::Finished => "upload_finished",
            EventName::Interrupted => "upload_interrupted",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with the cumulative progress of its entity.
#[derive(Debug, Clone, Copy)]
pub enum UploadEvent<'a> {
    /// Before the first offset fetch.
    Start { progress: &'a Progress },
    /// The service reported `offset` durable bytes; transfer resumes there.
    FetchOffset { offset: u64, progress: &'a Progress },
    /// A chunk of `chunk_size` bytes was acknowledged.
    Progress { chunk_size: u64, progress: &'a Progress },
    /// Every byte was acknowledged; finish is next.
    End { progress: &'a Progress },
    /// The service accepted the upload. `descriptions` holds the packed
    /// sequence, empty for prebuilt archives and raw entities.
    Finished {
        cluster_id: &'a str,
        descriptions: &'a [ImageDescription],
        progress: &'a Progress,
    },
    /// A retriable failure; the loop waits `delay` before refetching the offset.
    Interrupted {
        retries: u32,
        delay: Duration,
        reason: &'a SessionError,
        progress: &'a Progress,
    },
}

impl UploadEvent<'_> {
    pub fn name(&self) -> EventName {
        match self {
            UploadEvent::Start { .. } => EventName::Start,
            UploadEvent::FetchOffset { .. } => EventName::FetchOffset,
            UploadEvent::Progress { .. } => EventName::Progress,
            UploadEvent::End { .. } => EventName::End,
            UploadEvent::Finished { .. } => EventName::Finished,
            UploadEvent::Interrupted { .. } => EventName::Interrupted,
        }
    }

    pub fn progress(&self) -> &Progress {
        match self {
            UploadEvent::Start { progress }
            | UploadEvent::FetchOffset { progress, .. }
            | UploadEvent::Progress { progress, .. }
            | UploadEvent::End { progress }
            | UploadEvent::Finished { progress, .. }
            | UploadEvent::Interrupted { progress, .. } => progress,
        }
    }
}

/// Returned by a handler to stop the emitting operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Stop this entity's upload without treating it as a failure.
    #[error("upload cancelled by subscriber")]
    Cancelled,

    #[error("subscriber failed: {0}")]
    Failed(String),
}

type Handler = Box<dyn FnMut(&UploadEvent<'_>) -> Result<(), EventError> + Send>;

/// Ordered list of event subscribers.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<(Option<EventName>, Handler)>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to one event.
    pub fn on<F>(&mut self, name: EventName, handler: F) -> &mut Self
    where
        F: FnMut(&UploadEvent<'_>) -> Result<(), EventError> + Send + 'static,
    {
        self.handlers.push((Some(name), Box::new(handler)));
        self
    }

    /// Subscribes `handler` to every event.
    pub fn on_any<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&UploadEvent<'_>) -> Result<(), EventError> + Send + 'static,
    {
        self.handlers.push((None, Box::new(handler)));
        self
    }

    /// Moves `other`'s handlers after this bus's own.
    pub fn append(&mut self, mut other: EventBus) -> &mut Self {
        self.handlers.append(&mut other.handlers);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Delivers `event` to matching handlers in registration order.
    pub fn emit(&mut self, event: &UploadEvent<'_>) -> Result<(), EventError> {
        let name = event.name();
        for (filter, handler) in &mut self.handlers {
            if filter.is_none_or(|f| f == name) {
                handler(event)?;
            }
        }
        Ok(())
    }
}
