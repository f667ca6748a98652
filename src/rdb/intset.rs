//! Intset decoding: `<width u32><count u32><values...>`, little-endian.

use super::cursor::SliceCursor;
use super::RdbResult;
use bytes::Bytes;

pub fn decode(buf: &[u8]) -> RdbResult<Vec<Bytes>> {
    let mut cur = SliceCursor::new(buf, "intset");
    let width = cur.u32_le()?;
    let count = cur.u32_le()? as usize;

    if !matches!(width, 2 | 4 | 8) {
        return Err(cur.error(format!("invalid element width {}", width)));
    }
    if cur.remaining() != count * width as usize {
        return Err(cur.error(format!(
            "{} elements of {} bytes do not match {} remaining bytes",
            count,
            width,
            cur.remaining()
        )));
    }

    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let v = match width {
            2 => cur.i16_le()? as i64,
            4 => cur.i32_le()? as i64,
            _ => cur.i64_le()?,
        };
        out.push(Bytes::from(v.to_string()));
    }
    Ok(out)
}
