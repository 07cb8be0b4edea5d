//! Unsigned LEB128 varints: 7 bits per byte, low-order group first, high bit
//! set on every byte except the last.

use std::io::{Read, Write};

use crate::error::{ArchiveError, Result};

/// A `u64` never needs more than ten bytes.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf`, returning the number of bytes added.
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    while value & !0x7f != 0 {
        buf.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    buf.push(value as u8);
    buf.len() - start
}

/// Writes `value` to `out`, returning the number of bytes written.
pub fn write_varint<W: Write + ?Sized>(out: &mut W, value: u64) -> std::io::Result<usize> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut value = value;
    let mut len = 0;
    while value & !0x7f != 0 {
        buf[len] = 0x80 | (value & 0x7f) as u8;
        value >>= 7;
        len += 1;
    }
    buf[len] = value as u8;
    len += 1;
    out.write_all(&buf[..len])?;
    Ok(len)
}

/// Reads one varint from `input`.
///
/// Exhaustion before the terminal byte is [`ArchiveError::Truncated`]; a tenth
/// byte that still carries the continuation bit is
/// [`ArchiveError::MalformedVarint`].
pub fn read_varint<R: Read + ?Sized>(input: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut byte = [0u8; 1];
    for i in 0..MAX_VARINT_LEN {
        input.read_exact(&mut byte)?;
        value |= u64::from(byte[0] & 0x7f) << (7 * i);
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ArchiveError::MalformedVarint)
}

/// Decodes one varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(ArchiveError::MalformedVarint)
    } else {
        Err(ArchiveError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_small_values_are_one_byte() {
        let mut buf = Vec::new();
        assert_eq!(encode_varint(0, &mut buf), 1);
        assert_eq!(encode_varint(127, &mut buf), 1);
        assert_eq!(buf, vec![0x00, 0x7f]);
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = Vec::new();
        encode_varint(300, &mut buf);
        assert_eq!(buf, vec![0xac, 0x02]);

        buf.clear();
        encode_varint(u64::MAX, &mut buf);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(*buf.last().unwrap(), 0x01);
    }

    #[test]
    fn test_stream_and_slice_agree() {
        let values = [0u64, 1, 128, 16_383, 16_384, 1 << 35, u64::MAX];
        let mut streamed = Vec::new();
        for v in values {
            write_varint(&mut streamed, v).unwrap();
        }

        let mut cursor = Cursor::new(&streamed);
        let mut offset = 0;
        for v in values {
            assert_eq!(read_varint(&mut cursor).unwrap(), v);
            let (decoded, used) = decode_varint(&streamed[offset..]).unwrap();
            assert_eq!(decoded, v);
            offset += used;
        }
        assert_eq!(offset, streamed.len());
    }

    #[test]
    fn test_exhausted_stream_is_truncated() {
        let mut cursor = Cursor::new(vec![0x80, 0x80]);
        assert!(matches!(
            read_varint(&mut cursor),
            Err(ArchiveError::Truncated)
        ));
        assert!(matches!(
            decode_varint(&[0xff]),
            Err(ArchiveError::Truncated)
        ));
        assert!(matches!(
            read_varint(&mut Cursor::new(Vec::new())),
            Err(ArchiveError::Truncated)
        ));
    }

    #[test]
    fn test_overlong_is_malformed() {
        let overlong = vec![0xffu8; 11];
        assert!(matches!(
            read_varint(&mut Cursor::new(&overlong)),
            Err(ArchiveError::MalformedVarint)
        ));
        assert!(matches!(
            decode_varint(&overlong),
            Err(ArchiveError::MalformedVarint)
        ));
    }
}
