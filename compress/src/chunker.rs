//! Content-defined chunking.
//!
//! A chunk ends where a keyed hash of the trailing 10-byte window hits a
//! boundary pattern. Boundaries depend only on nearby bytes, so identical runs
//! of data chunk identically wherever they occur in the stream.
//!
//! The constants below are part of the archive format: changing any of them
//! moves every boundary.

use sortpack_common::SortKey;

/// Bytes hashed at each candidate position.
pub const WINDOW: usize = 10;

/// No cut is taken before this many bytes.
pub const MIN_CHUNK_LEN: usize = 4 * 1024;

/// A cut is forced once a chunk grows past this many bytes.
pub const MAX_CHUNK_LEN: usize = 16 * MIN_CHUNK_LEN;

const MASK: u64 = MIN_CHUNK_LEN as u64 - 1;

const SIP_K0: u64 = 111;
const SIP_K1: u64 = 11224;

/// SipHash-2-4 style mix of one window with the fixed chunking keys.
pub fn window_hash(window: &[u8]) -> u64 {
    let mut v0 = SIP_K0 ^ 0x736f_6d65_7073_6575;
    let mut v1 = SIP_K1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2 = SIP_K0 ^ 0x6c79_6765_6e65_7261;
    let mut v3 = SIP_K1 ^ 0x7465_6462_7974_6573;

    let len = window.len();
    let mut off = 0;
    while off <= len + 8 {
        let (m, rounds) = if off <= len {
            let mut m = 0u64;
            let mut i = 0;
            while i < 8 && off + i < len {
                m |= u64::from(window[off + i]) << (8 * i);
                i += 1;
            }
            if i < 8 {
                m |= (len as u64) << 56;
            }
            v3 ^= m;
            (m, 2)
        } else {
            v2 ^= 0xff;
            (0, 4)
        };
        for _ in 0..rounds {
            v0 = v0.wrapping_add(v1);
            v2 = v2.wrapping_add(v3);
            v1 = v1.rotate_left(13);
            v3 = v3.rotate_left(16);
            v1 ^= v0;
            v3 ^= v2;
            v0 = v0.rotate_left(32);
            v2 = v2.wrapping_add(v1);
            v0 = v0.wrapping_add(v3);
            v1 = v1.rotate_left(17);
            v3 = v3.rotate_left(21);
            v1 ^= v2;
            v3 ^= v0;
            v2 = v2.rotate_left(32);
        }
        v0 ^= m;
        off += 8;
    }
    v0 ^ v1 ^ v2 ^ v3
}

/// Bit `7 - k` is set when bytes whose top three bits equal `k` make up more
/// than 1/32 of the chunk.
pub fn signature(chunk: &[u8]) -> u8 {
    let mut counts = [0usize; 8];
    for &b in chunk {
        counts[usize::from(b >> 5)] += 1;
    }
    let threshold = chunk.len() / 32;
    counts
        .iter()
        .fold(0u8, |sig, &count| (sig << 1) | u8::from(count > threshold))
}

/// Finds the end of the chunk starting at `start`, returning it together with
/// the chunk's sort key.
pub fn cut(data: &[u8], start: usize) -> (usize, SortKey) {
    let mut min = u64::MAX;
    let mut pos = start;
    while pos < data.len() {
        if pos > start + WINDOW {
            let hash = window_hash(&data[pos - WINDOW..pos]);
            min = min.min(hash);

            let scanned = pos - start;
            if scanned > MIN_CHUNK_LEN
                && (hash & MASK == 1
                    || (scanned > 4 * MIN_CHUNK_LEN && hash & (MASK >> 1) == 1)
                    || scanned > MAX_CHUNK_LEN)
            {
                break;
            }
        }
        pos += 1;
    }

    let chunk = &data[start..pos];
    let key = SortKey::new(min, signature(chunk), chunk.len() as u32);
    (pos, key)
}

/// Iterator over the chunks of one buffer.
pub struct Chunks<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = (SortKey, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let (end, key) = cut(self.data, start);
        self.pos = end;
        Some((key, &self.data[start..end]))
    }
}

/// Splits `data` into content-defined chunks. Empty input yields nothing.
pub fn chunks(data: &[u8]) -> Chunks<'_> {
    Chunks { data, pos: 0 }
}
