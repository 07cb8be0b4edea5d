//! Leveled k-way merging of segments.
//!
//! Both pipelines use the same machinery: on the compress path chunks are
//! keyed and ordered by content, on the extract path they are unkeyed and
//! ordered by their first occurrence id (see the `Ord` impl on [`Chunk`]).

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::debug;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::chunk::Chunk;
use crate::common_config::PackConfig;
use crate::error::{ArchiveError, Result};
use crate::segment::{Segment, SegmentArena, SegmentReader};

struct Head {
    chunk: Chunk,
    source: usize,
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.chunk
            .cmp(&other.chunk)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

/// Streams the smallest current chunk across a set of open segments.
/// Ties go to the segment listed first.
pub struct KWayMerge {
    heap: BinaryHeap<Reverse<Head>>,
    readers: Vec<SegmentReader>,
}

impl KWayMerge {
    pub fn open(segments: &[Segment], buffer_size: usize) -> Result<Self> {
        let mut readers = Vec::with_capacity(segments.len());
        let mut heap = BinaryHeap::with_capacity(segments.len());
        for (source, segment) in segments.iter().enumerate() {
            let mut reader = segment.open(buffer_size)?;
            if let Some(chunk) = reader.next_chunk()? {
                heap.push(Reverse(Head { chunk, source }));
            }
            readers.push(reader);
        }
        Ok(KWayMerge { heap, readers })
    }

    fn pop(&mut self) -> Result<Option<Chunk>> {
        let Some(Reverse(Head { chunk, source })) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.readers[source].next_chunk()? {
            self.heap.push(Reverse(Head {
                chunk: next,
                source,
            }));
        }
        Ok(Some(chunk))
    }
}

impl Iterator for KWayMerge {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop().transpose()
    }
}

/// Folds runs of content-equal keyed chunks into one chunk carrying all ids.
pub struct Coalesce<I> {
    inner: I,
    pending: Option<Chunk>,
}

impl<I: Iterator<Item = Result<Chunk>>> Coalesce<I> {
    pub fn new(inner: I) -> Self {
        Coalesce {
            inner,
            pending: None,
        }
    }
}

impl<I: Iterator<Item = Result<Chunk>>> Iterator for Coalesce<I> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next() {
                Some(Ok(chunk)) => match self.pending.take() {
                    None => self.pending = Some(chunk),
                    Some(mut last) if last.same_content(&chunk) => {
                        last.absorb(chunk);
                        self.pending = Some(last);
                    }
                    Some(last) => {
                        self.pending = Some(chunk);
                        return Some(Ok(last));
                    }
                },
                Some(Err(e)) => return Some(Err(e)),
                None => return self.pending.take().map(Ok),
            }
        }
    }
}

/// Merges `group` into one new segment at `level`, deleting the inputs.
pub fn merge_group(
    group: Vec<Segment>,
    arena: &SegmentArena,
    level: u32,
    config: &PackConfig,
) -> Result<Segment> {
    let layout = group
        .first()
        .map(Segment::layout)
        .ok_or_else(|| ArchiveError::CorruptRecord("empty merge group".into()))?;
    let mut writer = arena.create(level, layout)?;
    let merge = KWayMerge::open(&group, config.segment_buffer_size(group.len()))?;
    for chunk in Coalesce::new(merge) {
        writer.push(&chunk?)?;
    }
    let merged = writer.finish()?;
    for segment in group {
        segment.delete()?;
    }
    Ok(merged)
}

/// Summary of a leveled reduction.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReduceStats {
    pub levels: u32,
    pub groups: u64,
}

/// Repeatedly merges groups of `merge_fan_in` segments until at most
/// `merge_fan_in` remain. Segment order is preserved level to level.
pub fn reduce_segments(
    mut segments: Vec<Segment>,
    arena: &SegmentArena,
    config: &PackConfig,
) -> Result<(Vec<Segment>, ReduceStats)> {
    let fan_in = config.merge_fan_in.max(2);
    let mut stats = ReduceStats::default();
    if segments.len() <= fan_in {
        return Ok((segments, stats));
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(config.merge_threads.max(1))
        .build()
        .map_err(|e| ArchiveError::Stream(std::io::Error::other(e)))?;

    while segments.len() > fan_in {
        stats.levels += 1;
        let level = stats.levels;

        let mut groups = Vec::with_capacity(segments.len().div_ceil(fan_in));
        let mut rest = segments.into_iter().peekable();
        while rest.peek().is_some() {
            groups.push(rest.by_ref().take(fan_in).collect::<Vec<_>>());
        }
        stats.groups += groups.len() as u64;
        debug!(
            "merge level {}: {} groups of up to {} segments",
            level,
            groups.len(),
            fan_in
        );

        segments = pool.install(|| {
            groups
                .into_par_iter()
                .map(|group| merge_group(group, arena, level, config))
                .collect::<Result<Vec<_>>>()
        })?;
    }

    Ok((segments, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{RecordLayout, SortKey};

    fn keyed(ids: &[u64], payload: &[u8]) -> Chunk {
        Chunk {
            ids: ids.to_vec(),
            key: Some(SortKey::new(payload.first().copied().unwrap_or(0) as u64, 0, payload.len() as u32)),
            payload: payload.to_vec(),
        }
    }

    fn plain(id: u64, payload: &[u8]) -> Chunk {
        Chunk {
            ids: vec![id],
            key: None,
            payload: payload.to_vec(),
        }
    }

    fn spill(arena: &SegmentArena, layout: RecordLayout, mut chunks: Vec<Chunk>) -> Segment {
        chunks.sort();
        let mut writer = arena.create(0, layout).unwrap();
        for c in &chunks {
            writer.push(c).unwrap();
        }
        writer.finish().unwrap()
    }

    fn drain(segments: &[Segment]) -> Vec<Chunk> {
        KWayMerge::open(segments, 4096)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_kway_merge_orders_across_segments() {
        let arena = SegmentArena::new(&PackConfig::default()).unwrap();
        let a = spill(&arena, RecordLayout::Plain, vec![plain(1, b"a"), plain(4, b"d")]);
        let b = spill(&arena, RecordLayout::Plain, vec![plain(2, b"b"), plain(3, b"c")]);
        let ids: Vec<u64> = drain(&[a, b]).iter().map(Chunk::first_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_coalesce_merges_equal_content() {
        let arena = SegmentArena::new(&PackConfig::default()).unwrap();
        let a = spill(&arena, RecordLayout::Keyed, vec![keyed(&[1], b"x"), keyed(&[5], b"y")]);
        let b = spill(&arena, RecordLayout::Keyed, vec![keyed(&[2, 3], b"x")]);
        let merge = KWayMerge::open(&[a, b], 4096).unwrap();
        let out = Coalesce::new(merge).collect::<Result<Vec<_>>>().unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload, b"x");
        // ties go to the earlier segment, so its ids come first
        assert_eq!(out[0].ids, vec![1, 2, 3]);
        assert_eq!(out[1].ids, vec![5]);
    }

    #[test]
    fn test_coalesce_leaves_unkeyed_alone() {
        let chunks = vec![Ok(plain(1, b"same")), Ok(plain(2, b"same"))];
        let out = Coalesce::new(chunks.into_iter())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_reduce_conserves_ids_across_levels() {
        let config = PackConfig {
            merge_fan_in: 3,
            merge_threads: 2,
            ..PackConfig::default()
        };
        let arena = SegmentArena::new(&config).unwrap();

        // 20 segments, each holding a few chunks drawn from a small alphabet
        let mut expected = Vec::new();
        let mut segments = Vec::new();
        let mut id = 1u64;
        for s in 0..20u8 {
            let mut chunks = Vec::new();
            for k in 0..3u8 {
                let payload = [b'a' + (s + k) % 5];
                chunks.push(keyed(&[id], &payload));
                expected.push(id);
                id += 1;
            }
            // collapse duplicates inside one segment the way the sorter does
            chunks.sort();
            let mut deduped: Vec<Chunk> = Vec::new();
            for c in chunks {
                match deduped.last_mut() {
                    Some(last) if last.same_content(&c) => last.absorb(c),
                    _ => deduped.push(c),
                }
            }
            segments.push(spill(&arena, RecordLayout::Keyed, deduped));
        }

        let (remaining, stats) = reduce_segments(segments, &arena, &config).unwrap();
        assert!(remaining.len() <= 3);
        assert!(stats.levels >= 2, "20 segments at fan-in 3 need several levels");

        let merged = Coalesce::new(KWayMerge::open(&remaining, 4096).unwrap())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(merged.len(), 5, "one record per distinct payload");

        let mut got: Vec<u64> = merged.iter().flat_map(|c| c.ids.iter().copied()).collect();
        got.sort_unstable();
        assert_eq!(got, expected);

        // consumed segments are gone, only the survivors remain on disk
        let on_disk = std::fs::read_dir(arena.path()).unwrap().count();
        assert_eq!(on_disk, remaining.len());
    }

    #[test]
    fn test_reduce_below_fan_in_is_a_no_op() {
        let config = PackConfig::default();
        let arena = SegmentArena::new(&config).unwrap();
        let seg = spill(&arena, RecordLayout::Plain, vec![plain(1, b"a")]);
        let (remaining, stats) = reduce_segments(vec![seg], &arena, &config).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(stats.levels, 0);
    }

    #[test]
    fn test_reduce_by_id_keeps_stream_order() {
        let config = PackConfig {
            merge_fan_in: 2,
            ..PackConfig::default()
        };
        let arena = SegmentArena::new(&config).unwrap();
        let mut segments = Vec::new();
        // interleaved ids across five segments
        for s in 0..5u64 {
            let chunks = (0..4u64).map(|k| plain(1 + s + 5 * k, &[s as u8])).collect();
            segments.push(spill(&arena, RecordLayout::Plain, chunks));
        }
        let (remaining, _) = reduce_segments(segments, &arena, &config).unwrap();
        let ids: Vec<u64> = drain(&remaining).iter().map(Chunk::first_id).collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
    }
}
