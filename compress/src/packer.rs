use std::{
    fs::File,
    io::{self, BufWriter, Read, Write},
    path::Path,
    thread,
    time::Instant,
};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::{write::ZlibEncoder, Compression};
use log::{debug, info};

use sortpack_common::{
    chunk::{write_record, write_sentinel},
    common_config::CONFIG,
    reduce_segments,
    varint::write_varint,
    ArchiveError, Coalesce, CompressionReport, KWayMerge, PackConfig, RecordLayout, Segment,
    SegmentArena, ARCHIVE_MAGIC,
};

use crate::chunker::chunks;
use crate::sorter::DedupTable;
use crate::tree::{TreeStats, TreeStream};

/// Buffers cycling between the reader thread and the chunking loop.
const BUFFERS_IN_FLIGHT: usize = 2;

/// Archives `input_dir` into `output` with the process-wide configuration and
/// the given deflate level.
pub fn compress_dir(input_dir: &Path, output: &Path, level: u32) -> Result<CompressionReport> {
    let config = PackConfig {
        level,
        ..(*CONFIG).clone()
    };
    compress_dir_with(input_dir, output, &config)
}

pub fn compress_dir_with(
    input_dir: &Path,
    output: &Path,
    config: &PackConfig,
) -> Result<CompressionReport> {
    if !input_dir.is_dir() {
        let err = io::Error::new(io::ErrorKind::NotFound, "not a directory");
        return Err(ArchiveError::at(input_dir, err))
            .with_context(|| format!("cannot archive {}", input_dir.display()));
    }
    let started = Instant::now();

    let arena = SegmentArena::new(config).context("creating segment directory")?;
    debug!("spilling segments to {}", arena.path().display());

    let spilled = spill_tree(input_dir, &arena, config)
        .with_context(|| format!("reading {}", input_dir.display()))?;
    let initial_segments = spilled.segments.len() as u64;
    info!(
        "[packer] {} files, {} dirs, {} bytes cut into {} chunks over {} segments",
        spilled.tree.files,
        spilled.tree.dirs,
        spilled.tree.bytes,
        spilled.chunks,
        initial_segments
    );

    let (segments, reduced) =
        reduce_segments(spilled.segments, &arena, config).context("merging segments")?;

    let unique_chunks = write_archive(output, segments, spilled.tree.bytes, config)
        .with_context(|| format!("writing archive {}", output.display()))?;

    let total_bytes_out = std::fs::metadata(output)
        .map(|m| m.len())
        .with_context(|| format!("stat {}", output.display()))?;
    let compression_ratio = if spilled.tree.bytes > 0 {
        (1.0 - total_bytes_out as f32 / spilled.tree.bytes as f32).max(0.0) * 100.0
    } else {
        0.0
    };

    info!(
        "[packer] wrote {} unique chunks, {} bytes in {:.2?}",
        unique_chunks,
        total_bytes_out,
        started.elapsed()
    );

    Ok(CompressionReport {
        total_files: spilled.tree.files,
        total_dirs: spilled.tree.dirs,
        total_bytes_in: spilled.tree.bytes,
        total_bytes_out,
        chunks: spilled.chunks,
        unique_chunks,
        initial_segments,
        merge_levels: reduced.levels,
        compression_ratio,
    })
}

struct Spilled {
    segments: Vec<Segment>,
    tree: TreeStats,
    chunks: u64,
}

/// Streams the tree through the chunker, spilling one sorted segment per
/// read buffer. Reading overlaps with chunking of the previous buffer.
fn spill_tree(root: &Path, arena: &SegmentArena, config: &PackConfig) -> Result<Spilled, ArchiveError> {
    let buffer_size = config.read_buffer_size.max(1);
    let (full_tx, full_rx) = bounded::<Vec<u8>>(1);
    let (free_tx, free_rx) = bounded::<Vec<u8>>(BUFFERS_IN_FLIGHT);
    for _ in 0..BUFFERS_IN_FLIGHT {
        // cannot fail, the channel has room for every buffer
        let _ = free_tx.send(Vec::with_capacity(buffer_size));
    }

    thread::scope(|scope| {
        let reader = scope.spawn(move || read_buffers(root, buffer_size, free_rx, full_tx));

        let chunked = chunk_buffers(full_rx, free_tx, arena);

        let tree = match reader.join() {
            Ok(result) => result?,
            Err(_) => {
                return Err(ArchiveError::Stream(io::Error::other(
                    "tree reader thread panicked",
                )))
            }
        };
        let (segments, chunks) = chunked?;
        Ok(Spilled {
            segments,
            tree,
            chunks,
        })
    })
}

fn read_buffers(
    root: &Path,
    buffer_size: usize,
    free: Receiver<Vec<u8>>,
    full: Sender<Vec<u8>>,
) -> Result<TreeStats, ArchiveError> {
    let mut stream = TreeStream::new(root);
    while let Ok(mut buf) = free.recv() {
        buf.clear();
        (&mut stream).take(buffer_size as u64).read_to_end(&mut buf)?;
        if buf.is_empty() {
            break;
        }
        debug!("[reader] filled {} bytes", buf.len());
        if full.send(buf).is_err() {
            // the chunking side bailed out, its error wins
            break;
        }
    }
    Ok(stream.stats())
}

fn chunk_buffers(
    full: Receiver<Vec<u8>>,
    free: Sender<Vec<u8>>,
    arena: &SegmentArena,
) -> Result<(Vec<Segment>, u64), ArchiveError> {
    let mut segments = Vec::new();
    let mut next_id = 1u64;
    for buf in full.iter() {
        let mut table = DedupTable::new();
        for (key, payload) in chunks(&buf) {
            table.insert(key, payload, next_id);
            next_id += 1;
        }
        let distinct = table.len();
        let occurrences = table.occurrences();
        let segment = table.spill(arena.create(0, RecordLayout::Keyed)?)?;
        debug!(
            "[chunker] {} bytes -> {} chunks, {} distinct, segment {}",
            buf.len(),
            occurrences,
            distinct,
            segment.path().display()
        );
        segments.push(segment);
        let _ = free.send(buf);
    }
    Ok((segments, next_id - 1))
}

/// Final merge straight into the deflated archive. Returns the number of
/// records written.
fn write_archive(
    output: &Path,
    segments: Vec<Segment>,
    stream_len: u64,
    config: &PackConfig,
) -> Result<u64, ArchiveError> {
    let file = File::create(output).map_err(|e| ArchiveError::at(output, e))?;
    let mut out = ZlibEncoder::new(BufWriter::new(file), Compression::new(config.level.min(9)));

    out.write_all(&ARCHIVE_MAGIC)?;
    write_varint(&mut out, stream_len)?;

    let mut records = 0u64;
    {
        let merge = KWayMerge::open(&segments, config.segment_buffer_size(segments.len()))?;
        for chunk in Coalesce::new(merge) {
            let chunk = chunk?;
            write_record(&mut out, &chunk.ids, None, &chunk.payload, RecordLayout::Plain)?;
            records += 1;
        }
    }
    write_sentinel(&mut out)?;

    let mut file = out.finish().map_err(|e| ArchiveError::at(output, e))?;
    file.flush().map_err(|e| ArchiveError::at(output, e))?;

    for segment in segments {
        segment.delete()?;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn small_config() -> PackConfig {
        PackConfig {
            read_buffer_size: 64 * 1024,
            merge_fan_in: 4,
            merge_buffer_budget: 256 * 1024,
            ..PackConfig::default()
        }
    }

    #[test]
    fn test_rejects_missing_input() {
        let dir = TempDir::new().unwrap();
        let err = compress_dir(&dir.path().join("missing"), &dir.path().join("out"), 1).unwrap_err();
        let archive = err.downcast_ref::<ArchiveError>().expect("archive error");
        assert_eq!(archive.kind(), sortpack_common::ErrorKind::Io);
    }

    #[test]
    fn test_small_buffers_force_merge_levels() {
        let src = TempDir::new().unwrap();
        for i in 0..20u32 {
            let body: Vec<u8> = (0..40_000u32).map(|j| (j.wrapping_mul(i + 3) % 253) as u8).collect();
            fs::write(src.path().join(format!("f{i:02}.bin")), body).unwrap();
        }
        let out = TempDir::new().unwrap();
        let archive = out.path().join("tree.blob");

        let report = compress_dir_with(src.path(), &archive, &small_config()).unwrap();
        assert_eq!(report.total_files, 20);
        assert!(report.initial_segments > 4);
        assert!(report.merge_levels >= 1);
        assert!(report.unique_chunks <= report.chunks);
        assert!(archive.exists());
    }

    #[test]
    fn test_empty_directory_still_writes_an_archive() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let archive = out.path().join("empty.blob");
        let report = compress_dir(src.path(), &archive, 1).unwrap();
        assert_eq!(report.total_bytes_in, 0);
        assert_eq!(report.chunks, 0);
        assert_eq!(report.unique_chunks, 0);
        assert!(report.total_bytes_out > 0);
    }
}
