use std::path::{Path, PathBuf};

use geoupload_protocol::ImageDescription;
use indexmap::IndexMap;

/// Descriptions partitioned by sequence key, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct SequenceGroups {
    groups: IndexMap<String, IndexMap<PathBuf, ImageDescription>>,
}

/// One sequence: its key and its descriptions keyed by filename.
#[derive(Debug, Clone, Copy)]
pub struct SequenceGroup<'a> {
    pub key: &'a str,
    images: &'a IndexMap<PathBuf, ImageDescription>,
}

impl<'a> SequenceGroup<'a> {
    /// Number of distinct images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn descriptions(&self) -> impl Iterator<Item = &'a ImageDescription> + 'a {
        self.images.values()
    }

    pub fn get(&self, filename: &Path) -> Option<&'a ImageDescription> {
        self.images.get(filename)
    }
}

impl SequenceGroups {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Groups in enumeration order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = SequenceGroup<'_>> {
        self.groups.iter().map(|(key, images)| SequenceGroup { key, images })
    }

    pub fn get(&self, key: &str) -> Option<SequenceGroup<'_>> {
        self.groups
            .get_key_value(key)
            .map(|(key, images)| SequenceGroup { key, images })
    }
}

/// Partitions descriptions by `MAPSequenceUUID`.
///
/// Descriptions without one all share a single fallback key, generated once
/// per call. Within a sequence a repeated filename replaces the earlier
/// description.
pub fn group_sequences(descriptions: impl IntoIterator<Item = ImageDescription>) -> SequenceGroups {
    let fallback = uuid::Uuid::new_v4().to_string();
    let mut groups: IndexMap<String, IndexMap<PathBuf, ImageDescription>> = IndexMap::new();
    for desc in descriptions {
        let key = desc.sequence_uuid.clone().unwrap_or_else(|| fallback.clone());
        groups
            .entry(key)
            .or_default()
            .insert(desc.filename.clone(), desc);
    }
    SequenceGroups { groups }
}
