//! Chunk records as they appear in segment files and in the archive body.
//!
//! A record is `ids: varint*, 0, [sort key], length: varint, payload`. An
//! empty id list (a lone `0`) is the sentinel that ends a segment or archive.

use std::cmp::Ordering;
use std::io::{Read, Write};

use crate::error::{ArchiveError, Result};
use crate::varint::{read_varint, write_varint};

/// Whether records carry a sort key between the id list and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Forward-path segments: records carry a [`SortKey`].
    Keyed,
    /// Archive body and extract-path segments.
    Plain,
}

/// Ordering key derived by the chunker. Field order is comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SortKey {
    pub hash_hi: u32,
    pub hash_lo: u32,
    pub signature: u32,
    pub length: u32,
}

impl SortKey {
    pub const ENCODED_LEN: usize = 16;

    /// Builds a key from the minimum window hash, byte signature and length.
    pub fn new(min_hash: u64, signature: u8, length: u32) -> Self {
        SortKey {
            hash_hi: (min_hash >> 32) as u32,
            hash_lo: min_hash as u32,
            signature: u32::from(signature),
            length,
        }
    }

    fn to_bytes(self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.hash_hi.to_be_bytes());
        out[4..8].copy_from_slice(&self.hash_lo.to_be_bytes());
        out[8..12].copy_from_slice(&self.signature.to_be_bytes());
        out[12..16].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    fn from_bytes(b: &[u8; Self::ENCODED_LEN]) -> Self {
        let word = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        SortKey {
            hash_hi: word(0),
            hash_lo: word(4),
            signature: word(8),
            length: word(12),
        }
    }
}

/// A payload together with every occurrence id that produced it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub ids: Vec<u64>,
    pub key: Option<SortKey>,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn first_id(&self) -> u64 {
        self.ids.first().copied().unwrap_or(0)
    }

    /// True when both chunks are keyed and carry the same content.
    pub fn same_content(&self, other: &Chunk) -> bool {
        self.key.is_some() && other.key.is_some() && self == other
    }

    /// Appends `other`'s ids, used when two content-equal chunks meet.
    pub fn absorb(&mut self, other: Chunk) {
        self.ids.extend(other.ids);
    }

    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W, layout: RecordLayout) -> Result<u64> {
        write_record(out, &self.ids, self.key.as_ref(), &self.payload, layout)
    }

    /// Reads the next record, or `None` at the sentinel.
    pub fn read_from<R: Read + ?Sized>(input: &mut R, layout: RecordLayout) -> Result<Option<Chunk>> {
        let mut ids = Vec::new();
        loop {
            let id = read_varint(input)?;
            if id == 0 {
                break;
            }
            ids.push(id);
        }
        if ids.is_empty() {
            return Ok(None);
        }

        let key = match layout {
            RecordLayout::Keyed => {
                let mut raw = [0u8; SortKey::ENCODED_LEN];
                input.read_exact(&mut raw)?;
                Some(SortKey::from_bytes(&raw))
            }
            RecordLayout::Plain => None,
        };

        let len = read_varint(input)?;
        let len = usize::try_from(len)
            .map_err(|_| ArchiveError::CorruptRecord(format!("chunk length {len} too large")))?;
        // grow with the data instead of trusting the declared length up front
        let mut payload = Vec::new();
        Read::take(&mut *input, len as u64).read_to_end(&mut payload)?;
        if payload.len() != len {
            return Err(ArchiveError::Truncated);
        }

        Ok(Some(Chunk { ids, key, payload }))
    }
}

/// Writes one record from borrowed parts, returning the bytes written.
pub fn write_record<W: Write + ?Sized>(
    out: &mut W,
    ids: &[u64],
    key: Option<&SortKey>,
    payload: &[u8],
    layout: RecordLayout,
) -> Result<u64> {
    debug_assert!(!ids.is_empty(), "persisted id lists are never empty");
    let mut written = 0u64;
    for &id in ids {
        written += write_varint(out, id)? as u64;
    }
    written += write_varint(out, 0)? as u64;
    if layout == RecordLayout::Keyed {
        let key = key.ok_or_else(|| {
            ArchiveError::CorruptRecord("keyed record written without a sort key".into())
        })?;
        out.write_all(&key.to_bytes())?;
        written += SortKey::ENCODED_LEN as u64;
    }
    written += write_varint(out, payload.len() as u64)? as u64;
    out.write_all(payload)?;
    written += payload.len() as u64;
    Ok(written)
}

/// Writes the empty-id-list sentinel.
pub fn write_sentinel<W: Write + ?Sized>(out: &mut W) -> Result<u64> {
    Ok(write_varint(out, 0)? as u64)
}

/// Keyed chunks compare by sort key, then payload length, then bytes. Unkeyed
/// chunks compare by their first occurrence id and sort before keyed ones.
impl Ord for Chunk {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.key, &other.key) {
            (Some(a), Some(b)) => a
                .cmp(b)
                .then_with(|| self.payload.len().cmp(&other.payload.len()))
                .then_with(|| self.payload.cmp(&other.payload)),
            (None, None) => self.first_id().cmp(&other.first_id()),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Chunk {}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn keyed(ids: &[u64], key: SortKey, payload: &[u8]) -> Chunk {
        Chunk {
            ids: ids.to_vec(),
            key: Some(key),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_keyed_record_layout() {
        let key = SortKey::new(0x0102_0304_0506_0708, 0b1000_0001, 3);
        let chunk = keyed(&[1, 300], key, b"abc");

        let mut buf = Vec::new();
        let written = chunk.write_to(&mut buf, RecordLayout::Keyed).unwrap();
        assert_eq!(written as usize, buf.len());
        // ids 1, 300 (two bytes), terminator
        assert_eq!(&buf[..4], &[0x01, 0xac, 0x02, 0x00]);
        assert_eq!(&buf[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&buf[8..12], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&buf[buf.len() - 4..], &[0x03, b'a', b'b', b'c']);

        let back = Chunk::read_from(&mut Cursor::new(&buf), RecordLayout::Keyed)
            .unwrap()
            .unwrap();
        assert_eq!(back.ids, vec![1, 300]);
        assert_eq!(back.key, Some(key));
        assert_eq!(back.payload, b"abc");
    }

    #[test]
    fn test_plain_record_has_no_key() {
        let chunk = Chunk {
            ids: vec![7],
            key: None,
            payload: b"xy".to_vec(),
        };
        let mut buf = Vec::new();
        chunk.write_to(&mut buf, RecordLayout::Plain).unwrap();
        assert_eq!(buf, vec![0x07, 0x00, 0x02, b'x', b'y']);
    }

    #[test]
    fn test_sentinel_reads_as_none() {
        let mut buf = Vec::new();
        write_sentinel(&mut buf).unwrap();
        let next = Chunk::read_from(&mut Cursor::new(&buf), RecordLayout::Plain).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn test_short_payload_is_truncated() {
        let buf = vec![0x01, 0x00, 0x05, b'a', b'b'];
        let err = Chunk::read_from(&mut Cursor::new(&buf), RecordLayout::Plain).unwrap_err();
        assert!(matches!(err, ArchiveError::Truncated));
    }

    #[test]
    fn test_keyed_order_breaks_ties_by_length_then_bytes() {
        let key = SortKey::new(5, 0, 2);
        let a = keyed(&[1], key, b"ab");
        let b = keyed(&[2], key, b"ac");
        let c = keyed(&[3], key, b"abc");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, keyed(&[99], key, b"ab"));
        assert!(a.same_content(&keyed(&[99], key, b"ab")));
    }

    #[test]
    fn test_unkeyed_order_is_first_id() {
        let a = Chunk {
            ids: vec![3, 9],
            key: None,
            payload: b"zzz".to_vec(),
        };
        let b = Chunk {
            ids: vec![4],
            key: None,
            payload: b"a".to_vec(),
        };
        assert!(a < b);
        assert!(!a.same_content(&a.clone()));
    }

    fn random_chunk(rng: &mut StdRng) -> Chunk {
        // narrow ranges so that ties actually happen
        let len = rng.random_range(0..3usize);
        let payload: Vec<u8> = (0..len).map(|_| rng.random_range(0..2u8)).collect();
        let key = if rng.random_range(0..8u8) == 0 {
            None
        } else {
            Some(SortKey {
                hash_hi: rng.random_range(0..2),
                hash_lo: rng.random_range(0..2),
                signature: rng.random_range(0..2),
                length: len as u32,
            })
        };
        Chunk {
            ids: vec![rng.random_range(1..4u64)],
            key,
            payload,
        }
    }

    #[test]
    fn test_comparator_is_a_total_order() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..2_000 {
            let a = random_chunk(&mut rng);
            let b = random_chunk(&mut rng);
            let c = random_chunk(&mut rng);

            // antisymmetry
            assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            // transitivity
            if a <= b && b <= c {
                assert!(a <= c, "{a:?} <= {b:?} <= {c:?}");
            }
            if a == b && b == c {
                assert_eq!(a, c);
            }
        }
    }
}
