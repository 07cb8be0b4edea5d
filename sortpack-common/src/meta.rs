//! Metadata records embedded in the serialized tree stream.
//!
//! ```text
//! i32 BE   record length, these four bytes included
//! u8       0 = directory, 1 = file
//! u8       0 = read-write, 1 = read-only
//! varint   last modified, epoch millis
//! varint   file length (files only)
//! u16 BE   path length, then UTF-8 relative path
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::common_config::MAX_RECORD_LEN;
use crate::error::{ArchiveError, Result};
use crate::varint::{decode_varint, encode_varint};

/// Bytes taken by the leading record length.
pub const RECORD_LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File { len: u64 },
}

/// One directory or file entry of the tree stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub read_only: bool,
    pub modified_ms: u64,
    /// `/`-separated path relative to the archived root.
    pub relative_path: String,
}

impl EntryMeta {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    /// Declared content length; zero for directories.
    pub fn file_len(&self) -> u64 {
        match self.kind {
            EntryKind::File { len } => len,
            EntryKind::Directory => 0,
        }
    }

    pub fn modified_time(&self) -> SystemTime {
        UNIX_EPOCH
            .checked_add(Duration::from_millis(self.modified_ms))
            .unwrap_or(UNIX_EPOCH)
    }

    /// Encodes the full record, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let path = self.relative_path.as_bytes();
        let path_len = u16::try_from(path.len()).map_err(|_| {
            ArchiveError::CorruptRecord(format!(
                "path of {} bytes does not fit a record: {}",
                path.len(),
                self.relative_path
            ))
        })?;

        let mut out = Vec::with_capacity(RECORD_LEN_PREFIX + 24 + path.len());
        out.extend_from_slice(&[0u8; RECORD_LEN_PREFIX]);
        out.push(u8::from(self.is_file()));
        out.push(u8::from(self.read_only));
        encode_varint(self.modified_ms, &mut out);
        if let EntryKind::File { len } = self.kind {
            encode_varint(len, &mut out);
        }
        out.extend_from_slice(&path_len.to_be_bytes());
        out.extend_from_slice(path);

        let body = out.len() - RECORD_LEN_PREFIX;
        if body > MAX_RECORD_LEN {
            return Err(ArchiveError::OversizedRecord {
                len: body as u64,
                limit: MAX_RECORD_LEN as u64,
            });
        }
        let total = out.len() as i32;
        out[..RECORD_LEN_PREFIX].copy_from_slice(&total.to_be_bytes());
        Ok(out)
    }

    /// Body length announced by a record length prefix.
    pub fn body_len(prefix: [u8; RECORD_LEN_PREFIX], limit: usize) -> Result<usize> {
        let total = i32::from_be_bytes(prefix);
        let body = i64::from(total) - RECORD_LEN_PREFIX as i64;
        if body < 0 {
            return Err(ArchiveError::CorruptRecord(format!(
                "record length {total} is shorter than its own prefix"
            )));
        }
        if body as u64 > limit as u64 {
            return Err(ArchiveError::OversizedRecord {
                len: body as u64,
                limit: limit as u64,
            });
        }
        Ok(body as usize)
    }

    /// Decodes a record body (everything after the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| ArchiveError::CorruptRecord(what.to_string());

        let (&is_file, rest) = body.split_first().ok_or_else(|| corrupt("missing kind"))?;
        let (&read_only, rest) = rest.split_first().ok_or_else(|| corrupt("missing flags"))?;
        let (modified_ms, used) = decode_varint(rest).map_err(|_| corrupt("bad mtime"))?;
        let mut rest = &rest[used..];

        let kind = match is_file {
            0 => EntryKind::Directory,
            1 => {
                let (len, used) = decode_varint(rest).map_err(|_| corrupt("bad file length"))?;
                rest = &rest[used..];
                EntryKind::File { len }
            }
            other => return Err(corrupt(&format!("unknown entry kind {other}"))),
        };

        if rest.len() < 2 {
            return Err(corrupt("missing path length"));
        }
        let path_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let path = &rest[2..];
        if path.len() != path_len {
            return Err(corrupt(&format!(
                "path length {} does not match the {} bytes left",
                path_len,
                path.len()
            )));
        }
        let relative_path = std::str::from_utf8(path)
            .map_err(|_| corrupt("path is not UTF-8"))?
            .to_string();

        Ok(EntryMeta {
            kind,
            read_only: read_only != 0,
            modified_ms,
            relative_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, len: u64) -> EntryMeta {
        EntryMeta {
            kind: EntryKind::File { len },
            read_only: true,
            modified_ms: 1_700_000_000_123,
            relative_path: path.to_string(),
        }
    }

    #[test]
    fn test_encode_layout() {
        let dir = EntryMeta {
            kind: EntryKind::Directory,
            read_only: false,
            modified_ms: 5,
            relative_path: "ab".to_string(),
        };
        let bytes = dir.encode().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 11, 0, 0, 5, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_body_decodes_back() {
        let meta = file("lib/x64-linux.so", 123_456);
        let record = meta.encode().unwrap();
        let prefix: [u8; 4] = record[..4].try_into().unwrap();
        let body = EntryMeta::body_len(prefix, MAX_RECORD_LEN).unwrap();
        assert_eq!(body, record.len() - 4);
        assert_eq!(EntryMeta::decode_body(&record[4..]).unwrap(), meta);
    }

    #[test]
    fn test_oversized_and_short_lengths_rejected() {
        let huge = ((MAX_RECORD_LEN + 5) as i32).to_be_bytes();
        assert!(matches!(
            EntryMeta::body_len(huge, MAX_RECORD_LEN),
            Err(ArchiveError::OversizedRecord { .. })
        ));
        assert!(matches!(
            EntryMeta::body_len(2i32.to_be_bytes(), MAX_RECORD_LEN),
            Err(ArchiveError::CorruptRecord(_))
        ));
        assert!(matches!(
            EntryMeta::body_len((-1i32).to_be_bytes(), MAX_RECORD_LEN),
            Err(ArchiveError::CorruptRecord(_))
        ));
    }

    #[test]
    fn test_long_path_rejected_at_encode() {
        let meta = file(&"a".repeat(MAX_RECORD_LEN), 1);
        assert!(matches!(
            meta.encode(),
            Err(ArchiveError::OversizedRecord { .. })
        ));
    }

    #[test]
    fn test_garbage_body_is_corrupt() {
        assert!(EntryMeta::decode_body(&[]).is_err());
        assert!(EntryMeta::decode_body(&[7, 0, 0, 0, 0]).is_err());
        assert!(EntryMeta::decode_body(&[0, 0, 1, 0, 9, b'a']).is_err());
        assert!(EntryMeta::decode_body(&[0, 0, 1, 0, 1, 0xff]).is_err());
    }
}
