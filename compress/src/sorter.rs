//! In-memory sort and dedup of the chunks cut from one read buffer.

use std::collections::BTreeMap;

use sortpack_common::{Segment, SegmentWriter, SortKey};

/// Chunk content borrowed from the read buffer, ordered the same way
/// keyed chunks are ordered in segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ContentRef<'a> {
    key: SortKey,
    payload: &'a [u8],
}

/// Distinct chunks of one buffer, each with the ids of every occurrence.
#[derive(Default)]
pub struct DedupTable<'a> {
    entries: BTreeMap<ContentRef<'a>, Vec<u64>>,
    occurrences: u64,
}

impl<'a> DedupTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records occurrence `id` of `payload`. Returns true when the content
    /// was not seen before in this buffer.
    pub fn insert(&mut self, key: SortKey, payload: &'a [u8], id: u64) -> bool {
        self.occurrences += 1;
        let ids = self.entries.entry(ContentRef { key, payload }).or_default();
        ids.push(id);
        ids.len() == 1
    }

    /// Distinct payloads held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    /// Writes every entry in content order and closes the segment.
    pub fn spill(self, mut writer: SegmentWriter) -> sortpack_common::error::Result<Segment> {
        for (content, ids) in &self.entries {
            writer.push_parts(ids, Some(&content.key), content.payload)?;
        }
        writer.finish()
    }
}
