//! Ziplist decoding.
//!
//! ```text
//! <zlbytes u32><zltail u32><zllen u16><entry>...<0xFF>
//! entry: <prevlen 1|5 bytes><encoding><data>
//! ```
//!
//! A `zllen` of 65535 means the count did not fit; entries are then scanned
//! up to the terminator.

use super::cursor::SliceCursor;
use super::RdbResult;
use bytes::Bytes;

const END: u8 = 0xFF;
const BIG_PREVLEN: u8 = 0xFE;
const UNKNOWN_COUNT: u16 = u16::MAX;

const INT16: u8 = 0xC0;
const INT32: u8 = 0xD0;
const INT64: u8 = 0xE0;
const INT24: u8 = 0xF0;
const INT8: u8 = 0xFE;

pub fn decode(buf: &[u8]) -> RdbResult<Vec<Bytes>> {
    let mut cur = SliceCursor::new(buf, "ziplist");
    let _zlbytes = cur.u32_le()?;
    let _zltail = cur.u32_le()?;
    let zllen = cur.u16_le()?;

    let mut out = Vec::new();
    if zllen == UNKNOWN_COUNT {
        while cur.peek()? != END {
            out.push(read_entry(&mut cur)?);
        }
    } else {
        out.reserve(zllen as usize);
        for _ in 0..zllen {
            out.push(read_entry(&mut cur)?);
        }
    }

    if cur.u8()? != END {
        return Err(cur.error("missing terminator"));
    }
    Ok(out)
}

/// Decodes a ziplist of alternating field/value entries.
pub fn decode_pairs(buf: &[u8]) -> RdbResult<Vec<(Bytes, Bytes)>> {
    pairs(decode(buf)?, "ziplist")
}

pub(crate) fn pairs(items: Vec<Bytes>, kind: &'static str) -> RdbResult<Vec<(Bytes, Bytes)>> {
    if items.len() % 2 != 0 {
        return Err(super::RdbError::container(
            kind,
            format!("odd number of entries ({}) for pairs", items.len()),
        ));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(a), Some(b)) = (iter.next(), iter.next()) {
        out.push((a, b));
    }
    Ok(out)
}

fn read_entry(cur: &mut SliceCursor<'_>) -> RdbResult<Bytes> {
    if cur.u8()? == BIG_PREVLEN {
        cur.skip(4)?;
    }

    let enc = cur.u8()?;
    match enc >> 6 {
        0 => {
            let len = (enc & 0x3f) as usize;
            return Ok(Bytes::copy_from_slice(cur.take(len)?));
        }
        1 => {
            let len = (((enc & 0x3f) as usize) << 8) | cur.u8()? as usize;
            return Ok(Bytes::copy_from_slice(cur.take(len)?));
        }
        2 => {
            let len = cur.u32_be()? as usize;
            return Ok(Bytes::copy_from_slice(cur.take(len)?));
        }
        _ => {}
    }

    let v: i64 = match enc {
        INT16 => cur.i16_le()? as i64,
        INT32 => cur.i32_le()? as i64,
        INT64 => cur.i64_le()?,
        INT24 => cur.i24_le()? as i64,
        INT8 => cur.u8()? as i8 as i64,
        0xF1..=0xFD => (enc & 0x0f) as i64 - 1,
        other => return Err(cur.error(format!("unknown encoding {:#04x}", other))),
    };
    Ok(Bytes::from(v.to_string()))
}
