//! Rebuilds the serialized tree stream from an archive.
//!
//! Records come out of the archive in content order. Each record is expanded
//! into one entry per occurrence id, batches of entries are spilled as
//! id-ordered segments, and a leveled merge brings the payloads back into
//! stream order.

use std::collections::BTreeMap;
use std::io::{self, BufReader, Read, Write};

use flate2::read::ZlibDecoder;
use log::{debug, trace, warn};

use sortpack_common::error::Result;
use sortpack_common::varint::read_varint;
use sortpack_common::{
    reduce_segments, ArchiveError, Chunk, KWayMerge, PackConfig, RecordLayout, Segment,
    SegmentArena, ARCHIVE_MAGIC,
};

const INFLATE_BUFFER: usize = 256 * 1024;

/// Counters from one restore.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreStats {
    /// Stream length announced in the archive header.
    pub declared_len: u64,
    /// Bytes handed to the sink.
    pub stream_bytes: u64,
    pub records: u64,
    pub occurrences: u64,
    pub initial_segments: u64,
    pub merge_levels: u32,
}

/// Reports a damaged deflate stream as a format error instead of a plain
/// I/O failure.
struct Inflate<R: Read> {
    inner: ZlibDecoder<R>,
}

impl<R: Read> Read for Inflate<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                ArchiveError::Inflate(e).into_io()
            }
            _ => e,
        })
    }
}

/// One batch of expanded records: occurrence id to the index of its payload.
struct Batch {
    order: BTreeMap<u64, usize>,
    payloads: Vec<Vec<u8>>,
    bytes: usize,
}

impl Batch {
    fn new() -> Self {
        Batch {
            order: BTreeMap::new(),
            payloads: Vec::new(),
            bytes: 0,
        }
    }

    fn add(&mut self, chunk: Chunk) -> Result<()> {
        let index = self.payloads.len();
        for &id in &chunk.ids {
            if self.order.insert(id, index).is_some() {
                return Err(ArchiveError::CorruptRecord(format!(
                    "occurrence id {id} stored twice"
                )));
            }
        }
        self.bytes += chunk.payload.len();
        self.payloads.push(chunk.payload);
        Ok(())
    }

    fn spill(self, arena: &SegmentArena) -> Result<Segment> {
        let mut writer = arena.create(0, RecordLayout::Plain)?;
        for (id, index) in &self.order {
            writer.push_parts(&[*id], None, &self.payloads[*index])?;
        }
        writer.finish()
    }
}

/// Inflates `compressed` and writes the original tree stream to `sink`.
///
/// The magic is checked before anything reaches the sink.
pub fn restore_stream<R, W>(compressed: R, sink: &mut W, config: &PackConfig) -> Result<RestoreStats>
where
    R: Read,
    W: Write + ?Sized,
{
    let mut input = BufReader::with_capacity(
        INFLATE_BUFFER,
        Inflate {
            inner: ZlibDecoder::new(compressed),
        },
    );

    let mut magic = [0u8; 4];
    input.read_exact(&mut magic)?;
    if magic != ARCHIVE_MAGIC {
        return Err(ArchiveError::BadMagic { found: magic });
    }
    let mut stats = RestoreStats {
        declared_len: read_varint(&mut input)?,
        ..RestoreStats::default()
    };
    debug!("[restore] archive declares {} stream bytes", stats.declared_len);

    let arena = SegmentArena::new(config)?;
    let mut segments = Vec::new();
    let mut batch = Batch::new();
    while let Some(chunk) = Chunk::read_from(&mut input, RecordLayout::Plain)? {
        trace!(
            "[restore] record ids={:?} len={} head={}",
            chunk.ids,
            chunk.payload.len(),
            hex::encode(&chunk.payload[..chunk.payload.len().min(16)])
        );
        stats.records += 1;
        stats.occurrences += chunk.ids.len() as u64;
        batch.add(chunk)?;
        if batch.bytes >= config.restore_batch_size {
            segments.push(std::mem::replace(&mut batch, Batch::new()).spill(&arena)?);
        }
    }
    if !batch.order.is_empty() {
        segments.push(batch.spill(&arena)?);
    }
    stats.initial_segments = segments.len() as u64;
    debug!(
        "[restore] {} records, {} occurrences in {} segments",
        stats.records, stats.occurrences, stats.initial_segments
    );

    let (segments, reduced) = reduce_segments(segments, &arena, config)?;
    stats.merge_levels = reduced.levels;

    let merge = KWayMerge::open(&segments, config.segment_buffer_size(segments.len()))?;
    let mut expected = 1u64;
    for chunk in merge {
        let chunk = chunk?;
        let id = chunk.first_id();
        if id != expected {
            return Err(ArchiveError::CorruptRecord(format!(
                "occurrence {expected} missing, next stored id is {id}"
            )));
        }
        expected += 1;
        sink.write_all(&chunk.payload)?;
        stats.stream_bytes += chunk.payload.len() as u64;
    }
    sink.flush()?;

    if stats.stream_bytes != stats.declared_len {
        warn!(
            "[restore] archive declared {} stream bytes but held {}",
            stats.declared_len, stats.stream_bytes
        );
    }
    Ok(stats)
}
