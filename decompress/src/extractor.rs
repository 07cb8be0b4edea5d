//! Turns a restored tree stream back into files and directories.
//!
//! [`ExtractorSink`] is a push parser: bytes may arrive in pieces of any size
//! and the sink keeps just enough state to resume where the last push ended.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, trace, warn};

use sortpack_common::error::Result;
use sortpack_common::meta::RECORD_LEN_PREFIX;
use sortpack_common::platform::native_library_name;
use sortpack_common::{ArchiveError, EntryKind, EntryMeta, ExtractReport};

const FILE_BUFFER: usize = 256 * 1024;

/// What to materialize from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractMode {
    /// Every directory and file under its recorded path.
    Full,
    /// Only files whose last path component is `expected_name`, written to
    /// `dest/alt_name`. The last match wins.
    SingleTarget {
        expected_name: String,
        alt_name: String,
    },
}

impl ExtractMode {
    /// Picks the library built for the running platform, e.g. `x64-linux.so`.
    pub fn native_library(alt_name: impl Into<String>) -> Self {
        ExtractMode::SingleTarget {
            expected_name: native_library_name(),
            alt_name: alt_name.into(),
        }
    }
}

enum SinkState {
    AwaitingHeader {
        prefix: [u8; RECORD_LEN_PREFIX],
        filled: usize,
    },
    AwaitingRecord {
        body: Vec<u8>,
        needed: usize,
    },
    CopyingFilePayload {
        target: Option<OpenTarget>,
        remaining: u64,
    },
}

impl SinkState {
    fn header() -> Self {
        SinkState::AwaitingHeader {
            prefix: [0; RECORD_LEN_PREFIX],
            filled: 0,
        }
    }
}

struct OpenTarget {
    out: BufWriter<File>,
    path: PathBuf,
    meta: EntryMeta,
}

/// Write-only sink that extracts the tree stream pushed into it.
pub struct ExtractorSink {
    dest: PathBuf,
    mode: ExtractMode,
    max_record_len: usize,
    state: SinkState,
    directories: Vec<(PathBuf, EntryMeta)>,
    report: ExtractReport,
}

impl ExtractorSink {
    pub fn new(dest: impl Into<PathBuf>, mode: ExtractMode, max_record_len: usize) -> Self {
        ExtractorSink {
            dest: dest.into(),
            mode,
            max_record_len,
            state: SinkState::header(),
            directories: Vec::new(),
            report: ExtractReport::default(),
        }
    }

    /// Feeds the next piece of the stream.
    pub fn push(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match &mut self.state {
                SinkState::AwaitingHeader { prefix, filled } => {
                    let n = (RECORD_LEN_PREFIX - *filled).min(data.len());
                    prefix[*filled..*filled + n].copy_from_slice(&data[..n]);
                    *filled += n;
                    data = &data[n..];
                    if *filled == RECORD_LEN_PREFIX {
                        let needed = EntryMeta::body_len(*prefix, self.max_record_len)?;
                        self.state = SinkState::AwaitingRecord {
                            body: Vec::with_capacity(needed),
                            needed,
                        };
                    }
                }
                SinkState::AwaitingRecord { body, needed } => {
                    let n = (*needed - body.len()).min(data.len());
                    body.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    if body.len() == *needed {
                        let meta = EntryMeta::decode_body(body)?;
                        self.state = self.begin_entry(meta)?;
                    }
                }
                SinkState::CopyingFilePayload { target, remaining } => {
                    let n = (*remaining).min(data.len() as u64) as usize;
                    if let Some(open) = target {
                        open.out
                            .write_all(&data[..n])
                            .map_err(|e| ArchiveError::at(&open.path, e))?;
                    }
                    *remaining -= n as u64;
                    data = &data[n..];
                    if *remaining == 0 {
                        if let Some(open) = target.take() {
                            self.complete_file(open)?;
                        }
                        self.state = SinkState::header();
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks that the stream ended on a record boundary and applies the
    /// deferred directory attributes, deepest directories first.
    pub fn finish(mut self) -> Result<ExtractReport> {
        match &self.state {
            SinkState::AwaitingHeader { filled: 0, .. } => {}
            _ => return Err(ArchiveError::Truncated),
        }

        if self.mode == ExtractMode::Full {
            fs::create_dir_all(&self.dest).map_err(|e| ArchiveError::at(&self.dest, e))?;
        }

        self.directories
            .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, meta) in &self.directories {
            if let Err(e) = set_modified(path, meta) {
                warn!("cannot set modification time of {}: {}", path.display(), e);
            }
            if meta.read_only {
                if let Err(e) = set_read_only(path) {
                    warn!("cannot mark {} read-only: {}", path.display(), e);
                }
            }
        }
        Ok(self.report)
    }

    fn begin_entry(&mut self, meta: EntryMeta) -> Result<SinkState> {
        let relative = checked_relative(&meta.relative_path)?;
        trace!(
            "entry {} kind={:?} read_only={} modified={}",
            meta.relative_path,
            meta.kind,
            meta.read_only,
            meta.modified_ms
        );

        let len = match meta.kind {
            EntryKind::Directory => {
                if self.mode == ExtractMode::Full {
                    let path = self.dest.join(relative);
                    fs::create_dir_all(&path).map_err(|e| ArchiveError::at(&path, e))?;
                    if let Err(e) = set_modified(&path, &meta) {
                        warn!("cannot set modification time of {}: {}", path.display(), e);
                    }
                    self.report.dirs_created += 1;
                    self.directories.push((path, meta));
                }
                return Ok(SinkState::header());
            }
            EntryKind::File { len } => len,
        };

        let Some(path) = self.target_path(&relative) else {
            self.report.files_skipped += 1;
            if len == 0 {
                return Ok(SinkState::header());
            }
            return Ok(SinkState::CopyingFilePayload {
                target: None,
                remaining: len,
            });
        };

        let open = self.open_target(path, meta)?;
        if len == 0 {
            self.complete_file(open)?;
            return Ok(SinkState::header());
        }
        Ok(SinkState::CopyingFilePayload {
            target: Some(open),
            remaining: len,
        })
    }

    fn target_path(&self, relative: &Path) -> Option<PathBuf> {
        match &self.mode {
            ExtractMode::Full => Some(self.dest.join(relative)),
            ExtractMode::SingleTarget {
                expected_name,
                alt_name,
            } => {
                let name = relative.file_name()?;
                (name == expected_name.as_str()).then(|| self.dest.join(alt_name))
            }
        }
    }

    fn open_target(&mut self, path: PathBuf, meta: EntryMeta) -> Result<OpenTarget> {
        let parent = match self.mode {
            ExtractMode::Full => path.parent().unwrap_or(self.dest.as_path()),
            ExtractMode::SingleTarget { .. } => self.dest.as_path(),
        };
        fs::create_dir_all(parent).map_err(|e| ArchiveError::at(parent, e))?;
        // a previous match may have left a read-only file behind
        if let Ok(existing) = fs::metadata(&path) {
            let mut perms = existing.permissions();
            if perms.readonly() {
                perms.set_readonly(false);
                fs::set_permissions(&path, perms).map_err(|e| ArchiveError::at(&path, e))?;
            }
        }
        let file = File::create(&path).map_err(|e| ArchiveError::at(&path, e))?;
        debug!("writing {} ({} bytes)", path.display(), meta.file_len());
        Ok(OpenTarget {
            out: BufWriter::with_capacity(FILE_BUFFER, file),
            path,
            meta,
        })
    }

    fn complete_file(&mut self, open: OpenTarget) -> Result<()> {
        let OpenTarget { out, path, meta } = open;
        let file = out
            .into_inner()
            .map_err(|e| ArchiveError::at(&path, e.into_error()))?;
        file.set_modified(meta.modified_time())
            .map_err(|e| ArchiveError::at(&path, e))?;
        drop(file);
        if meta.read_only {
            set_read_only(&path).map_err(|e| ArchiveError::at(&path, e))?;
        }
        self.report.files_written += 1;
        self.report.bytes_written += meta.file_len();
        Ok(())
    }
}

impl Write for ExtractorSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf).map_err(ArchiveError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let SinkState::CopyingFilePayload {
            target: Some(open), ..
        } = &mut self.state
        {
            open.out.flush()?;
        }
        Ok(())
    }
}

/// Rejects absolute paths and any path that could leave the destination.
fn checked_relative(path: &str) -> Result<PathBuf> {
    let unsafe_path = || ArchiveError::CorruptRecord(format!("unsafe path {path:?}"));
    if path.is_empty() || path.starts_with('/') {
        return Err(unsafe_path());
    }
    // each `/` part must be one plain component on this platform, which also
    // rejects `\`-separated parts and drive prefixes on Windows
    let mut relative = PathBuf::new();
    for part in path.split('/') {
        match Path::new(part).components().next() {
            Some(Component::Normal(name)) if name == part => relative.push(name),
            _ => return Err(unsafe_path()),
        }
    }
    Ok(relative)
}

fn set_modified(path: &Path, meta: &EntryMeta) -> io::Result<()> {
    File::open(path)?.set_modified(meta.modified_time())
}

fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}
