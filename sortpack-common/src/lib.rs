pub mod chunk;
pub mod common_config;
pub mod error;
pub mod merge;
pub mod meta;
pub mod platform;
pub mod segment;
pub mod varint;

pub use chunk::{Chunk, RecordLayout, SortKey};
pub use common_config::{PackConfig, ARCHIVE_MAGIC, CONFIG, DEFAULT_LEVEL, MAX_RECORD_LEN};
pub use error::{ArchiveError, ErrorKind};
pub use merge::{reduce_segments, Coalesce, KWayMerge, ReduceStats};
pub use meta::{EntryKind, EntryMeta};
pub use segment::{Segment, SegmentArena, SegmentWriter};

#[derive(Debug, Default, Clone)]
pub struct CompressionReport {
    pub total_files: u64,
    pub total_dirs: u64,
    /// Length of the serialized tree stream.
    pub total_bytes_in: u64,
    /// Size of the compressed archive on disk.
    pub total_bytes_out: u64,
    /// Chunk occurrences cut from the stream (one id each).
    pub chunks: u64,
    /// Distinct payloads written to the archive.
    pub unique_chunks: u64,
    pub initial_segments: u64,
    pub merge_levels: u32,
    pub compression_ratio: f32, // 0.0–100.0
}

#[derive(Debug, Default, Clone)]
pub struct ExtractReport {
    pub dirs_created: u64,
    pub files_written: u64,
    pub files_skipped: u64,
    pub bytes_written: u64,
    /// Length of the restored tree stream.
    pub stream_bytes: u64,
    pub merge_levels: u32,
}
