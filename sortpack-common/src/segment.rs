//! Sorted runs of chunk records spilled to temporary files.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::trace;
use tempfile::TempDir;

use crate::chunk::{write_record, write_sentinel, Chunk, RecordLayout, SortKey};
use crate::common_config::PackConfig;
use crate::error::{ArchiveError, Result};

const WRITE_BUFFER: usize = 1024 * 1024;

/// Owns the scratch directory holding every segment of one compress or
/// extract call. Dropping the arena removes whatever is left.
pub struct SegmentArena {
    dir: TempDir,
    next: AtomicU64,
}

impl SegmentArena {
    pub fn new(config: &PackConfig) -> Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(".sortpack-");
            b
        };
        let dir = match &config.temp_dir {
            Some(parent) => builder
                .tempdir_in(parent)
                .map_err(|e| ArchiveError::at(parent, e))?,
            None => builder
                .tempdir()
                .map_err(|e| ArchiveError::at(std::env::temp_dir(), e))?,
        };
        trace!("segment arena at {}", dir.path().display());
        Ok(SegmentArena {
            dir,
            next: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Reserves a fresh file name for a segment produced at `level`.
    pub fn allocate(&self, level: u32) -> PathBuf {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        self.dir.path().join(format!("seg-{level}-{n:06}.tmp"))
    }

    /// Opens a writer on a freshly allocated segment file.
    pub fn create(&self, level: u32, layout: RecordLayout) -> Result<SegmentWriter> {
        SegmentWriter::create(self.allocate(level), layout)
    }
}

/// A finished segment on disk.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    layout: RecordLayout,
    records: u64,
    bytes: u64,
}

impl Segment {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn open(&self, buffer_size: usize) -> Result<SegmentReader> {
        let file = File::open(&self.path).map_err(|e| ArchiveError::at(&self.path, e))?;
        Ok(SegmentReader {
            input: BufReader::with_capacity(buffer_size, file),
            layout: self.layout,
        })
    }

    /// Removes the file once it has been folded into a later pass.
    pub fn delete(self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|e| ArchiveError::at(&self.path, e))
    }
}

/// Streams records into a segment file in the order they are pushed.
pub struct SegmentWriter {
    path: PathBuf,
    out: BufWriter<File>,
    layout: RecordLayout,
    records: u64,
    bytes: u64,
}

impl SegmentWriter {
    pub fn create(path: PathBuf, layout: RecordLayout) -> Result<Self> {
        let file = File::create(&path).map_err(|e| ArchiveError::at(&path, e))?;
        Ok(SegmentWriter {
            path,
            out: BufWriter::with_capacity(WRITE_BUFFER, file),
            layout,
            records: 0,
            bytes: 0,
        })
    }

    pub fn push(&mut self, chunk: &Chunk) -> Result<()> {
        self.push_parts(&chunk.ids, chunk.key.as_ref(), &chunk.payload)
    }

    pub fn push_parts(&mut self, ids: &[u64], key: Option<&SortKey>, payload: &[u8]) -> Result<()> {
        let written = write_record(&mut self.out, ids, key, payload, self.layout)
            .map_err(|e| self.locate(e))?;
        self.bytes += written;
        self.records += 1;
        Ok(())
    }

    /// Writes the sentinel and closes the file.
    pub fn finish(mut self) -> Result<Segment> {
        let written = write_sentinel(&mut self.out).map_err(|e| self.locate(e))?;
        self.bytes += written;
        self.out
            .flush()
            .map_err(|e| ArchiveError::at(&self.path, e))?;
        trace!(
            "segment {} closed: {} records, {} bytes",
            self.path.display(),
            self.records,
            self.bytes
        );
        Ok(Segment {
            path: self.path,
            layout: self.layout,
            records: self.records,
            bytes: self.bytes,
        })
    }

    fn locate(&self, err: ArchiveError) -> ArchiveError {
        match err {
            ArchiveError::Stream(source) => ArchiveError::at(&self.path, source),
            other => other,
        }
    }
}

/// Sequential reader over one segment.
pub struct SegmentReader {
    input: BufReader<File>,
    layout: RecordLayout,
}

impl SegmentReader {
    /// Next record, or `None` once the sentinel is reached.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        Chunk::read_from(&mut self.input, self.layout)
    }
}
