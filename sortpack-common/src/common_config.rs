use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Archive magic, first four bytes of every inflated archive.
pub const ARCHIVE_MAGIC: [u8; 4] = *b"H2A1";

/// Upper bound for a metadata record body in the tree stream.
pub const MAX_RECORD_LEN: usize = 16 * 1024;

/// Deflate level used when the caller does not pick one (fastest).
pub const DEFAULT_LEVEL: u32 = 1;

/// Buffer sizes and fan-in for the compress and extract pipelines.
#[derive(Debug, Clone)]
pub struct PackConfig {
    /// Bytes of tree stream chunked and sorted per segment.
    pub read_buffer_size: usize,
    /// Maximum number of segments merged at once.
    pub merge_fan_in: usize,
    /// Read-buffer bytes shared by all segments open in one merge group.
    pub merge_buffer_budget: usize,
    /// Stored payload bytes expanded per segment on the extract path.
    pub restore_batch_size: usize,
    /// Largest metadata record body accepted by the extractor.
    pub max_record_len: usize,
    /// Merge groups of one level that may run at the same time.
    pub merge_threads: usize,
    /// Where segment files are spilled; system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
    pub level: u32,
}

impl PackConfig {
    /// Per-segment read buffer when `open` segments are merged together.
    pub fn segment_buffer_size(&self, open: usize) -> usize {
        let share = self.merge_buffer_budget / self.merge_threads.max(1);
        (share / open.max(1)).max(4096)
    }
}

impl Default for PackConfig {
    fn default() -> Self {
        PackConfig {
            read_buffer_size: 32 * 1024 * 1024,
            merge_fan_in: 64,
            merge_buffer_budget: 64 * 1024 * 1024,
            restore_batch_size: 16 * 1024 * 1024,
            max_record_len: MAX_RECORD_LEN,
            merge_threads: 1,
            temp_dir: None,
            level: DEFAULT_LEVEL,
        }
    }
}

pub static CONFIG: Lazy<PackConfig> = Lazy::new(strategic_config);

fn strategic_config() -> PackConfig {
    let refresh = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
    let mut sys = System::new_with_specifics(refresh);
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let cores = System::physical_core_count().unwrap_or(1).max(1);

    let mut config = PackConfig::default();

    // every concurrently merged group holds a full budget of read buffers
    let affordable = (total_memory / 4) / config.merge_buffer_budget as u64;
    config.merge_threads = cores.min(affordable.max(1) as usize);

    debug!(
        "[strategic_config] {} cores, {} MiB memory",
        cores,
        total_memory / (1024 * 1024)
    );
    debug!(
        "[strategic_config] read_buffer_size: {} merge_fan_in: {} merge_buffer_budget: {}",
        config.read_buffer_size, config.merge_fan_in, config.merge_buffer_budget
    );
    debug!(
        "[strategic_config] restore_batch_size: {} merge_threads: {}",
        config.restore_batch_size, config.merge_threads
    );

    config
}
