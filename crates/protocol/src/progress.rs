use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Cumulative state of one upload session.
///
/// Created when the session starts, mutated in place by the transfer loop,
/// read by event subscribers, and dropped when the session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes acknowledged by the last chunk.
    pub chunk_size: u64,
    /// Bytes the service holds for this session.
    pub offset: u64,
    /// Total size of the entity being uploaded.
    pub entity_size: u64,
    /// Number of sequences in the run (1 for single-entity uploads).
    pub total_sequence_count: usize,
    /// 0-based position of this sequence in the run.
    pub sequence_idx: usize,
    /// Images packed into the entity, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_image_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_uuid: Option<String>,
    /// Consecutive failures since the last acknowledged chunk.
    pub retries: u32,
    /// Content fingerprint; also the session key stem.
    pub md5sum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_path: Option<PathBuf>,
    /// Set only once the service has accepted the finished upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

impl Progress {
    /// Payload for a single-entity upload (prebuilt archive or raw video).
    pub fn single_entity(import_path: impl Into<PathBuf>) -> Self {
        Self {
            total_sequence_count: 1,
            sequence_idx: 0,
            import_path: Some(import_path.into()),
            ..Default::default()
        }
    }

    /// Payload for the `sequence_idx`-th sequence of a multi-sequence run.
    pub fn for_sequence(
        sequence_uuid: impl Into<String>,
        sequence_idx: usize,
        total_sequence_count: usize,
        image_count: usize,
    ) -> Self {
        Self {
            total_sequence_count,
            sequence_idx,
            sequence_image_count: Some(image_count),
            sequence_uuid: Some(sequence_uuid.into()),
            ..Default::default()
        }
    }

    /// Fraction of the entity held by the service, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.entity_size == 0 {
            return 0.0;
        }
        (self.offset as f64 / self.entity_size as f64).min(1.0)
    }
}
