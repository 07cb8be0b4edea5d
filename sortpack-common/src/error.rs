//! Error types shared by the compress and extract pipelines.

use std::io;
use std::path::PathBuf;

/// Coarse classification of an [`ArchiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The bytes are not a well-formed archive or tree stream.
    Format,
    /// The stream ended in the middle of a record.
    Truncation,
    /// The filesystem or the underlying stream failed.
    Io,
}

/// Errors raised while writing or reading archives, segments and tree streams.
///
/// Every variant is fatal for the call that produced it.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The inflated archive does not start with `H2A1`.
    #[error("bad archive magic {found:02x?}, expected \"H2A1\"")]
    BadMagic {
        /// The four bytes actually found.
        found: [u8; 4],
    },

    /// A varint kept its continuation bit past the tenth byte.
    #[error("malformed varint: more than 9 continuation bytes")]
    MalformedVarint,

    /// A metadata record declared a body larger than the safety bound.
    #[error("metadata record body of {len} bytes exceeds the {limit} byte limit")]
    OversizedRecord {
        /// Declared body length.
        len: u64,
        /// Configured limit.
        limit: u64,
    },

    /// A metadata record could not be parsed or names an unsafe path.
    #[error("corrupt metadata record: {0}")]
    CorruptRecord(String),

    /// The compressed stream is not valid DEFLATE data.
    #[error("corrupt deflate stream")]
    Inflate(#[source] io::Error),

    /// The stream ended before the current record was complete.
    #[error("unexpected end of stream")]
    Truncated,

    /// Filesystem failure tied to a path.
    #[error("{}", path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Stream failure with no single path to blame.
    #[error("archive stream i/o failed")]
    Stream(#[source] io::Error),
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::BadMagic { .. }
            | ArchiveError::MalformedVarint
            | ArchiveError::OversizedRecord { .. }
            | ArchiveError::CorruptRecord(_)
            | ArchiveError::Inflate(_) => ErrorKind::Format,
            ArchiveError::Truncated => ErrorKind::Truncation,
            ArchiveError::Io { .. } | ArchiveError::Stream(_) => ErrorKind::Io,
        }
    }

    /// Attach a path to a bare I/O error.
    pub fn at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap this error so it can cross a `Read`/`Write` boundary.
    pub fn into_io(self) -> io::Error {
        let kind = match self.kind() {
            ErrorKind::Format => io::ErrorKind::InvalidData,
            ErrorKind::Truncation => io::ErrorKind::UnexpectedEof,
            ErrorKind::Io => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

/// Unwraps an `ArchiveError` smuggled through `io::Error`, otherwise maps
/// end-of-file to [`ArchiveError::Truncated`].
impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<ArchiveError>())
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(archive) = inner.downcast::<ArchiveError>() {
                    return *archive;
                }
            }
            return ArchiveError::Stream(io::Error::other("lost wrapped archive error"));
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ArchiveError::Truncated,
            _ => ArchiveError::Stream(err),
        }
    }
}

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_io_error() {
        let original = ArchiveError::OversizedRecord {
            len: 20_000,
            limit: 16_384,
        };
        let io_err = original.into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back = ArchiveError::from(io_err);
        assert!(matches!(
            back,
            ArchiveError::OversizedRecord { len: 20_000, .. }
        ));
    }

    #[test]
    fn test_eof_maps_to_truncated() {
        let err = ArchiveError::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert_eq!(err.kind(), ErrorKind::Truncation);
    }

    #[test]
    fn test_io_display_leaves_the_cause_to_the_source_chain() {
        let err = ArchiveError::at("/tmp/missing", io::Error::other("disk on fire"));
        assert_eq!(err.to_string(), "/tmp/missing");
        let cause = std::error::Error::source(&err).expect("source");
        assert_eq!(cause.to_string(), "disk on fire");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(ArchiveError::MalformedVarint.kind(), ErrorKind::Format);
        assert_eq!(
            ArchiveError::BadMagic { found: *b"ABCD" }.kind(),
            ErrorKind::Format
        );
        assert_eq!(
            ArchiveError::at("/tmp/x", io::Error::from(io::ErrorKind::NotFound)).kind(),
            ErrorKind::Io
        );
    }
}
