//! Listpack decoding.
//!
//! ```text
//! <total-bytes u32><count u16><element>...<0xFF>
//! element: <encoding+data><backlen>
//! ```
//!
//! | first byte  | meaning                          |
//! |-------------|----------------------------------|
//! | `0xxxxxxx`  | 7-bit unsigned integer           |
//! | `10xxxxxx`  | string, 6-bit length             |
//! | `110xxxxx`  | 13-bit signed integer            |
//! | `1110xxxx`  | string, 12-bit length            |
//! | `11110000`  | string, 32-bit length            |
//! | `0xF1..F4`  | 16/24/32/64-bit signed integer   |
//!
//! `backlen` stores the element's encoded size for reverse traversal; the
//! forward decoder only needs to skip it.

use super::cursor::SliceCursor;
use super::RdbResult;
use bytes::Bytes;

const END: u8 = 0xFF;

pub fn decode(buf: &[u8]) -> RdbResult<Vec<Bytes>> {
    let mut cur = SliceCursor::new(buf, "listpack");
    let _total = cur.u32_le()?;
    let _count = cur.u16_le()?;

    // The header count saturates at 65535, so always scan to the terminator.
    let mut out = Vec::new();
    while cur.peek()? != END {
        out.push(read_element(&mut cur)?);
    }
    Ok(out)
}

/// Decodes a listpack of alternating field/value elements.
pub fn decode_pairs(buf: &[u8]) -> RdbResult<Vec<(Bytes, Bytes)>> {
    super::ziplist::pairs(decode(buf)?, "listpack")
}

/// Number of bytes used by the backlen of an element of `len` encoded bytes.
fn backlen_size(len: usize) -> usize {
    if len <= 127 {
        1
    } else if len < 16383 {
        2
    } else if len < 2097151 {
        3
    } else if len < 268435455 {
        4
    } else {
        5
    }
}

/// Two's-complement recovery for an integer stored in fewer than 64 bits.
fn signed(uval: u64, bits: u32) -> i64 {
    let negstart = 1u64 << (bits - 1);
    let negmax = (1u64 << bits) - 1;
    if uval >= negstart {
        -((negmax - uval) as i64) - 1
    } else {
        uval as i64
    }
}

fn read_element(cur: &mut SliceCursor<'_>) -> RdbResult<Bytes> {
    let start = cur.position();
    let b = cur.u8()?;

    let value = if b & 0x80 == 0 {
        Bytes::from((b & 0x7f).to_string())
    } else if b & 0xC0 == 0x80 {
        let len = (b & 0x3f) as usize;
        Bytes::copy_from_slice(cur.take(len)?)
    } else if b & 0xE0 == 0xC0 {
        let uval = (((b & 0x1f) as u64) << 8) | cur.u8()? as u64;
        Bytes::from(signed(uval, 13).to_string())
    } else if b & 0xF0 == 0xE0 {
        let len = (((b & 0x0f) as usize) << 8) | cur.u8()? as usize;
        Bytes::copy_from_slice(cur.take(len)?)
    } else {
        match b {
            0xF0 => {
                let len = cur.u32_le()? as usize;
                Bytes::copy_from_slice(cur.take(len)?)
            }
            0xF1 => Bytes::from(cur.i16_le()?.to_string()),
            0xF2 => Bytes::from(cur.i24_le()?.to_string()),
            0xF3 => Bytes::from(cur.i32_le()?.to_string()),
            0xF4 => Bytes::from(cur.i64_le()?.to_string()),
            other => return Err(cur.error(format!("unknown encoding {:#04x}", other))),
        }
    };

    let encoded = cur.position() - start;
    cur.skip(backlen_size(encoded))?;
    Ok(value)
}
