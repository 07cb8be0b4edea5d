//! Serializes a directory tree into one byte stream of metadata records, each
//! file record followed by the file's contents.
//!
//! The stream is pulled through [`Read`]; nothing is buffered beyond the
//! current record header and the open file.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, trace};
use walkdir::{DirEntry, WalkDir};

use sortpack_common::{ArchiveError, EntryKind, EntryMeta};

const FILE_BUFFER: usize = 1024 * 1024;

/// Counters gathered while the tree is streamed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeStats {
    pub files: u64,
    pub dirs: u64,
    /// Bytes handed out through `read`.
    pub bytes: u64,
}

enum StreamState {
    AwaitingEntry,
    Header {
        bytes: Vec<u8>,
        pos: usize,
        file: Option<OpenFile>,
    },
    CopyingFile(OpenFile),
    Finished,
}

struct OpenFile {
    input: BufReader<File>,
    remaining: u64,
    path: PathBuf,
}

/// Single-pass reader over a directory tree. Subdirectories of a directory
/// come before its files, each group ordered by name.
pub struct TreeStream {
    root: PathBuf,
    walker: walkdir::IntoIter,
    state: StreamState,
    stats: TreeStats,
}

impl TreeStream {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(true)
            .sort_by(|a, b| {
                b.file_type()
                    .is_dir()
                    .cmp(&a.file_type().is_dir())
                    .then_with(|| a.file_name().cmp(b.file_name()))
            })
            .into_iter();
        TreeStream {
            root,
            walker,
            state: StreamState::AwaitingEntry,
            stats: TreeStats::default(),
        }
    }

    pub fn stats(&self) -> TreeStats {
        self.stats
    }

    fn next_entry(&mut self) -> Result<Option<StreamState>, ArchiveError> {
        loop {
            let entry = match self.walker.next() {
                None => return Ok(None),
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    return Err(ArchiveError::at(path, io::Error::from(e)));
                }
            };
            if let Some(state) = self.open_entry(&entry)? {
                return Ok(Some(state));
            }
        }
    }

    fn open_entry(&mut self, entry: &DirEntry) -> Result<Option<StreamState>, ArchiveError> {
        let path = entry.path();
        let metadata = entry
            .metadata()
            .map_err(|e| ArchiveError::at(path, io::Error::from(e)))?;

        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else if metadata.is_file() {
            EntryKind::File {
                len: metadata.len(),
            }
        } else {
            debug!("skipping special file {}", path.display());
            return Ok(None);
        };

        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let meta = EntryMeta {
            kind,
            read_only: metadata.permissions().readonly(),
            modified_ms,
            relative_path: relative_name(&self.root, path)?,
        };
        let bytes = meta.encode()?;
        trace!(
            "entry {} ({} byte record, read_only={}, modified={})",
            meta.relative_path,
            bytes.len(),
            meta.read_only,
            meta.modified_ms
        );

        let file = match kind {
            EntryKind::Directory => {
                self.stats.dirs += 1;
                None
            }
            EntryKind::File { len } => {
                self.stats.files += 1;
                let handle = File::open(path).map_err(|e| ArchiveError::at(path, e))?;
                Some(OpenFile {
                    input: BufReader::with_capacity(FILE_BUFFER, handle),
                    remaining: len,
                    path: path.to_path_buf(),
                })
            }
        };

        Ok(Some(StreamState::Header {
            bytes,
            pos: 0,
            file,
        }))
    }
}

impl Read for TreeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.state {
                StreamState::Finished => return Ok(0),
                StreamState::AwaitingEntry => match self.next_entry() {
                    Ok(Some(next)) => self.state = next,
                    Ok(None) => self.state = StreamState::Finished,
                    Err(e) => return Err(e.into_io()),
                },
                StreamState::Header { bytes, pos, file } => {
                    if *pos < bytes.len() {
                        let n = (bytes.len() - *pos).min(buf.len());
                        buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
                        *pos += n;
                        self.stats.bytes += n as u64;
                        return Ok(n);
                    }
                    self.state = match file.take() {
                        Some(open) => StreamState::CopyingFile(open),
                        None => StreamState::AwaitingEntry,
                    };
                }
                StreamState::CopyingFile(open) => {
                    if open.remaining == 0 {
                        self.state = StreamState::AwaitingEntry;
                        continue;
                    }
                    let want = open.remaining.min(buf.len() as u64) as usize;
                    let n = open
                        .input
                        .read(&mut buf[..want])
                        .map_err(|e| ArchiveError::at(&open.path, e).into_io())?;
                    if n == 0 {
                        let shrunk = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file shrank by {} bytes while archiving", open.remaining),
                        );
                        return Err(ArchiveError::at(&open.path, shrunk).into_io());
                    }
                    open.remaining -= n as u64;
                    self.stats.bytes += n as u64;
                    return Ok(n);
                }
            }
        }
    }
}

/// `/`-joined path of `path` below `root`.
fn relative_name(root: &Path, path: &Path) -> Result<String, ArchiveError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ArchiveError::CorruptRecord(format!(
            "{} is not below {}",
            path.display(),
            root.display()
        ))
    })?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(|| {
                ArchiveError::CorruptRecord(format!("non UTF-8 path {}", path.display()))
            })?),
            other => {
                return Err(ArchiveError::CorruptRecord(format!(
                    "unexpected component {other:?} in {}",
                    path.display()
                )))
            }
        }
    }
    Ok(parts.join("/"))
}
