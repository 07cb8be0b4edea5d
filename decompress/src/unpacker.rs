use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

use sortpack_common::{common_config::CONFIG, ArchiveError, ExtractReport, PackConfig};

use crate::extractor::{ExtractMode, ExtractorSink};
use crate::restorer::restore_stream;

const ARCHIVE_READ_BUFFER: usize = 1024 * 1024;

/// Extracts the archive at `archive_path` into `output_dir`.
pub fn extract_archive(archive_path: &Path, output_dir: &Path, mode: ExtractMode) -> Result<ExtractReport> {
    extract_archive_with(archive_path, output_dir, mode, &CONFIG)
}

pub fn extract_archive_with(
    archive_path: &Path,
    output_dir: &Path,
    mode: ExtractMode,
    config: &PackConfig,
) -> Result<ExtractReport> {
    let file = File::open(archive_path)
        .map_err(|e| ArchiveError::at(archive_path, e))
        .with_context(|| format!("opening archive {}", archive_path.display()))?;
    extract_from_reader(
        BufReader::with_capacity(ARCHIVE_READ_BUFFER, file),
        output_dir,
        mode,
        config,
    )
    .with_context(|| format!("extracting {}", archive_path.display()))
}

/// Extracts an archive read from any byte source, e.g. an embedded resource.
pub fn extract_from_reader<R: Read>(
    reader: R,
    output_dir: &Path,
    mode: ExtractMode,
    config: &PackConfig,
) -> Result<ExtractReport> {
    let started = Instant::now();
    info!("[unpacker] extracting into {} ({:?})", output_dir.display(), mode);

    let mut sink = ExtractorSink::new(output_dir, mode, config.max_record_len);
    let stats = restore_stream(reader, &mut sink, config)?;
    let mut report = sink.finish()?;
    report.stream_bytes = stats.stream_bytes;
    report.merge_levels = stats.merge_levels;

    info!(
        "[unpacker] {} files, {} dirs, {} bytes in {:.2?}",
        report.files_written,
        report.dirs_created,
        report.bytes_written,
        started.elapsed()
    );
    Ok(report)
}
