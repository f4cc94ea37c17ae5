//! Structural checks for v1-encoded updates and state vectors.
//!
//! Yrs sizes its collections from the counts it reads, so a count larger than
//! the input could ever hold aborts the process on allocation. These walks read
//! the same layout without allocating and stop at such counts, at overflowing
//! clocks and at non UTF-8 strings, before the bytes reach the decoder.

use std::str;

/// Nesting limit for binary `Any` values.
const MAX_DEPTH: usize = 128;

/// Smallest encodings, in bytes, of the repeated elements.
const MIN_STATE_ENTRY: u64 = 2;
const MIN_CLIENT_HEADER: u64 = 3;
const MIN_BLOCK: u64 = 2;
const MIN_DELETE_CLIENT: u64 = 2;
const MIN_RANGE: u64 = 2;
const MIN_STRING: u64 = 1;
const MIN_ANY: u64 = 1;
const MIN_MAP_ENTRY: u64 = 2;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const TYPE_XML_ELEMENT: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(crate) enum WireError {
    #[error("unexpected end of input at byte {0}")]
    EndOfInput(usize),
    #[error("malformed varint at byte {0}")]
    VarInt(usize),
    #[error("count {count} at byte {at} exceeds the remaining input")]
    Count { count: u64, at: usize },
    #[error("clock overflow at byte {0}")]
    ClockOverflow(usize),
    #[error("string at byte {0} is not valid utf-8")]
    Utf8(usize),
    #[error("unknown {kind} tag {tag} at byte {at}")]
    Tag { kind: &'static str, tag: u8, at: usize },
    #[error("values nested deeper than 128 levels")]
    TooDeep,
}

type Result<T> = std::result::Result<T, WireError>;

/// Check a v1 state vector: a client count, then client and clock pairs.
pub(crate) fn check_state_vector(bytes: &[u8]) -> Result<()> {
    let mut r = Reader::new(bytes);
    let clients = r.count_u32(MIN_STATE_ENTRY)?;
    for _ in 0..clients {
        r.var_u64()?;
        r.var_u32()?;
    }
    Ok(())
}

/// Check a v1 update: per-client block lists followed by a delete set.
pub(crate) fn check_update(bytes: &[u8]) -> Result<()> {
    let mut r = Reader::new(bytes);
    let clients = r.count_u32(MIN_CLIENT_HEADER)?;
    for _ in 0..clients {
        let blocks = r.count_u32(MIN_BLOCK)?;
        r.var_u32()?;
        let at = r.pos;
        let mut clock = u64::from(r.var_u32()?);
        for _ in 0..blocks {
            clock += block(&mut r)?;
            if clock > u64::from(u32::MAX) {
                return Err(WireError::ClockOverflow(at));
            }
        }
    }
    delete_set(&mut r)
}

/// One block; returns the clock span it covers.
fn block(r: &mut Reader<'_>) -> Result<u64> {
    let at = r.pos;
    let info = r.u8()?;
    match info {
        BLOCK_GC | BLOCK_SKIP => Ok(u64::from(r.var_u32()?)),
        info => {
            if info & HAS_ORIGIN != 0 {
                id(r)?;
            }
            if info & HAS_RIGHT_ORIGIN != 0 {
                id(r)?;
            }
            if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
                if r.var_u32()? == 1 {
                    r.string()?;
                } else {
                    id(r)?;
                }
                if info & HAS_PARENT_SUB != 0 {
                    r.string()?;
                }
            }
            content(r, info & 0b1111, at)
        }
    }
}

fn id(r: &mut Reader<'_>) -> Result<()> {
    r.var_u32()?;
    r.var_u32()?;
    Ok(())
}

/// Item content; returns its length in clock units.
fn content(r: &mut Reader<'_>, kind: u8, at: usize) -> Result<u64> {
    match kind {
        CONTENT_DELETED => Ok(u64::from(r.var_u32()?)),
        CONTENT_JSON => {
            let len_at = r.pos;
            let len = r.var_u32()?;
            if i32::try_from(len).is_err() {
                return Err(WireError::Count {
                    count: u64::from(len),
                    at: len_at,
                });
            }
            // The decoder reads one string past the count.
            let strings = u64::from(len) + 1;
            r.ensure_room(strings, MIN_STRING, len_at)?;
            for _ in 0..strings {
                r.string()?;
            }
            Ok(strings)
        }
        CONTENT_BINARY => {
            r.buf()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let s = r.string()?;
            Ok(s.encode_utf16().count() as u64)
        }
        CONTENT_EMBED => {
            r.string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            r.string()?;
            r.string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            let tag_at = r.pos;
            match r.u8()? {
                0..=2 | 4..=6 | 9 | 15 => Ok(1),
                TYPE_XML_ELEMENT => {
                    r.string()?;
                    Ok(1)
                }
                tag => Err(WireError::Tag {
                    kind: "type",
                    tag,
                    at: tag_at,
                }),
            }
        }
        CONTENT_ANY => {
            let len = r.count_u32(MIN_ANY)?;
            for _ in 0..len {
                any(r, 0)?;
            }
            Ok(len)
        }
        CONTENT_DOC => {
            r.string()?;
            any(r, 0)?;
            Ok(1)
        }
        CONTENT_MOVE => {
            let flags = r.var_i64()?;
            id(r)?;
            if flags & 1 == 0 {
                id(r)?;
            }
            Ok(1)
        }
        tag => Err(WireError::Tag {
            kind: "content",
            tag,
            at,
        }),
    }
}

/// Binary `Any` value.
fn any(r: &mut Reader<'_>, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    let at = r.pos;
    match r.u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => {}
        125 => {
            r.var_i64()?;
        }
        124 => {
            r.take(4)?;
        }
        123 | 122 => {
            r.take(8)?;
        }
        119 => {
            r.string()?;
        }
        118 => {
            let len = r.count_u64(MIN_MAP_ENTRY)?;
            for _ in 0..len {
                r.string()?;
                any(r, depth + 1)?;
            }
        }
        117 => {
            let len = r.count_u64(MIN_ANY)?;
            for _ in 0..len {
                any(r, depth + 1)?;
            }
        }
        116 => {
            r.buf()?;
        }
        tag => {
            return Err(WireError::Tag {
                kind: "any",
                tag,
                at,
            })
        }
    }
    Ok(())
}

fn delete_set(r: &mut Reader<'_>) -> Result<()> {
    let clients = r.count_u32(MIN_DELETE_CLIENT)?;
    for _ in 0..clients {
        r.var_u32()?;
        let ranges = r.count_u32(MIN_RANGE)?;
        for _ in 0..ranges {
            let at = r.pos;
            let clock = u64::from(r.var_u32()?);
            let len = u64::from(r.var_u32()?);
            if clock + len > u64::from(u32::MAX) {
                return Err(WireError::ClockOverflow(at));
            }
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> u64 {
        (self.bytes.len() - self.pos) as u64
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(WireError::EndOfInput(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: u64) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(WireError::EndOfInput(self.bytes.len()));
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.bytes[start..self.pos])
    }

    /// Unsigned LEB128, wrapping the way the decoder does past 64 bits.
    fn var_u64(&mut self) -> Result<u64> {
        let at = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= u64::wrapping_shl(u64::from(byte & 0x7F), shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(value);
            }
            if shift > 70 {
                return Err(WireError::VarInt(at));
            }
        }
    }

    fn var_u32(&mut self) -> Result<u32> {
        let at = self.pos;
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= u32::wrapping_shl(u32::from(byte & 0x7F), shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(value);
            }
            if shift > 70 {
                return Err(WireError::VarInt(at));
            }
        }
    }

    /// Signed varint: sign in bit 6 of the first byte. Only magnitudes below
    /// 2^63 are accepted.
    fn var_i64(&mut self) -> Result<i64> {
        let at = self.pos;
        let first = self.u8()?;
        let negative = first & 0x40 != 0;
        let mut value = u64::from(first & 0x3F);
        let mut byte = first;
        let mut shift = 6u32;
        while byte & 0x80 != 0 {
            byte = self.u8()?;
            let bits = u64::from(byte & 0x7F);
            if shift >= 63 || (shift > 56 && bits >> (63 - shift) != 0) {
                return Err(WireError::VarInt(at));
            }
            value |= bits << shift;
            shift += 7;
        }
        let value = value as i64;
        Ok(if negative { -value } else { value })
    }

    fn buf(&mut self) -> Result<&'a [u8]> {
        let len = self.var_u32()?;
        self.take(u64::from(len))
    }

    fn string(&mut self) -> Result<&'a str> {
        let at = self.pos;
        let bytes = self.buf()?;
        str::from_utf8(bytes).map_err(|_| WireError::Utf8(at))
    }

    fn count_u32(&mut self, min_size: u64) -> Result<u64> {
        let at = self.pos;
        let count = u64::from(self.var_u32()?);
        self.ensure_room(count, min_size, at)?;
        Ok(count)
    }

    fn count_u64(&mut self, min_size: u64) -> Result<u64> {
        let at = self.pos;
        let count = self.var_u64()?;
        self.ensure_room(count, min_size, at)?;
        Ok(count)
    }

    fn ensure_room(&self, count: u64, min_size: u64, at: usize) -> Result<()> {
        if count.saturating_mul(min_size) > self.remaining() {
            return Err(WireError::Count { count, at });
        }
        Ok(())
    }
}
