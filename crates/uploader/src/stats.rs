//! Upload statistics collected from lifecycle events.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::events::{EventBus, EventName, UploadEvent};

const MIB: f64 = 1024.0 * 1024.0;

/// Timing and size of one uploaded entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityStats {
    pub md5sum: String,
    pub entity_size: u64,
    pub image_count: usize,
    /// Smallest offset the service reported; bytes below it were not sent.
    pub first_offset: Option<u64>,
    /// Transfer time, excluding backoff waits.
    pub total_time: Duration,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    last_restart: Option<Instant>,
}

impl EntityStats {
    fn new(md5sum: String, entity_size: u64, image_count: usize) -> Self {
        Self {
            md5sum,
            entity_size,
            image_count,
            first_offset: None,
            total_time: Duration::ZERO,
            started_at: Instant::now(),
            ended_at: None,
            last_restart: None,
        }
    }

    /// Bytes actually sent during this run.
    pub fn uploaded_size(&self) -> u64 {
        self.entity_size.saturating_sub(self.first_offset.unwrap_or(0))
    }

    fn close_interval(&mut self, now: Instant) {
        if let Some(restart) = self.last_restart.take() {
            self.total_time += now - restart;
        }
    }
}

/// Aggregate over all uploaded entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadSummary {
    pub images: usize,
    pub sequences: usize,
    /// Total entity size, MiB.
    pub size: f64,
    /// Bytes sent during the run, MiB.
    pub uploaded_size: f64,
    /// MiB per second of transfer time.
    pub speed: f64,
    /// Transfer time in seconds.
    pub time: f64,
}

/// Summarizes finished entities.
pub fn summarize(stats: &[EntityStats]) -> UploadSummary {
    let images = stats.iter().map(|s| s.image_count).sum();
    let size = stats.iter().map(|s| s.entity_size).sum::<u64>() as f64 / MIB;
    let uploaded_size = stats.iter().map(|s| s.uploaded_size()).sum::<u64>() as f64 / MIB;
    let time = stats
        .iter()
        .map(|s| s.total_time)
        .sum::<Duration>()
        .as_secs_f64();
    let speed = if time > 0.0 { uploaded_size / time } else { 0.0 };

    UploadSummary {
        images,
        sequences: stats.len(),
        size,
        uploaded_size,
        speed,
        time,
    }
}

pub fn log_summary(summary: &UploadSummary) {
    info!("{:8}  images uploaded", summary.images);
    info!("{:8}  sequences uploaded", summary.sequences);
    info!("{:8.1}M data in total", summary.size);
    info!("{:8.1}M data uploaded", summary.uploaded_size);
    info!("{:8.1}s upload time", summary.time);
}

#[derive(Debug, Default)]
struct Collected {
    current: Option<EntityStats>,
    finished: Vec<EntityStats>,
}

/// Event subscriber recording [`EntityStats`] for every entity that reaches
/// `upload_end`.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    inner: Arc<Mutex<Collected>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, events: &mut EventBus) {
        let inner = Arc::clone(&self.inner);
        events.on_any(move |event| {
            if let Ok(mut collected) = inner.lock() {
                collected.record(event);
            }
            Ok(())
        });
    }

    /// Entities that finished transferring so far.
    pub fn stats(&self) -> Vec<EntityStats> {
        self.inner
            .lock()
            .map(|c| c.finished.clone())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> UploadSummary {
        summarize(&self.stats())
    }
}

impl Collected {
    fn record(&mut self, event: &UploadEvent<'_>) {
        let now = Instant::now();
        match event.name() {
            EventName::Start => {
                let p = event.progress();
                self.current = Some(EntityStats::new(
                    p.md5sum.clone(),
                    p.entity_size,
                    p.sequence_image_count.unwrap_or(0),
                ));
            }
            EventName::FetchOffset => {
                if let (Some(stats), UploadEvent::FetchOffset { offset, .. }) =
                    (self.current.as_mut(), event)
                {
                    stats.last_restart = Some(now);
                    stats.first_offset =
                        Some(stats.first_offset.map_or(*offset, |o| o.min(*offset)));
                }
            }
            EventName::Interrupted => {
                if let Some(stats) = self.current.as_mut() {
                    stats.close_interval(now);
                }
            }
            EventName::End => {
                if let Some(mut stats) = self.current.take() {
                    stats.close_interval(now);
                    stats.ended_at = Some(now);
                    self.finished.push(stats);
                }
            }
            EventName::Progress | EventName::Finished => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geoupload_protocol::Progress;
    use geoupload_transfer::SessionError;

    fn progress(size: u64, images: usize) -> Progress {
        Progress {
            md5sum: "abcd".into(),
            entity_size: size,
            sequence_image_count: Some(images),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn excludes_backoff_from_transfer_time() {
        let collector = StatsCollector::new();
        let mut bus = EventBus::new();
        collector.subscribe(&mut bus);
        let p = progress(4 * 1024 * 1024, 3);
        let err = SessionError::Timeout("t".into());

        bus.emit(&UploadEvent::Start { progress: &p }).unwrap();
        bus.emit(&UploadEvent::FetchOffset {
            offset: 1024 * 1024,
            progress: &p,
        })
        .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        bus.emit(&UploadEvent::Interrupted {
            retries: 1,
            delay: Duration::from_secs(2),
            reason: &err,
            progress: &p,
        })
        .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        bus.emit(&UploadEvent::FetchOffset {
            offset: 2 * 1024 * 1024,
            progress: &p,
        })
        .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        bus.emit(&UploadEvent::End { progress: &p }).unwrap();

        let stats = collector.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_time, Duration::from_secs(3));
        assert_eq!(stats[0].first_offset, Some(1024 * 1024));

        let summary = collector.summary();
        assert_eq!(summary.images, 3);
        assert_eq!(summary.sequences, 1);
        assert_eq!(summary.size, 4.0);
        assert_eq!(summary.uploaded_size, 3.0);
        assert_eq!(summary.time, 3.0);
        assert_eq!(summary.speed, 1.0);
    }

    #[tokio::test]
    async fn cancelled_entities_are_not_counted() {
        let collector = StatsCollector::new();
        let mut bus = EventBus::new();
        collector.subscribe(&mut bus);
        let p = progress(10, 1);
        bus.emit(&UploadEvent::Start { progress: &p }).unwrap();
        assert!(collector.stats().is_empty());
        assert_eq!(collector.summary(), UploadSummary::default());
    }
}
