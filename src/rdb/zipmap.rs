//! Zipmap decoding (hashes written by Redis < 2.6).
//!
//! ```text
//! <zmlen><len>key<len><free>value<free bytes>...<0xFF>
//! ```
//!
//! Lengths are one byte below 254, otherwise 254 followed by a 4-byte
//! little-endian length.

use super::cursor::SliceCursor;
use super::RdbResult;
use bytes::Bytes;

const END: u8 = 0xFF;
const BIG_LEN: u8 = 254;

pub fn decode_pairs(buf: &[u8]) -> RdbResult<Vec<(Bytes, Bytes)>> {
    let mut cur = SliceCursor::new(buf, "zipmap");
    let _zmlen = cur.u8()?;

    let mut out = Vec::new();
    loop {
        let Some(key_len) = read_len(&mut cur)? else {
            break;
        };
        let key = Bytes::copy_from_slice(cur.take(key_len)?);

        let value_len =
            read_len(&mut cur)?.ok_or_else(|| cur.error("terminator in place of value"))?;
        let free = cur.u8()? as usize;
        let value = Bytes::copy_from_slice(cur.take(value_len)?);
        cur.skip(free)?;

        out.push((key, value));
    }
    Ok(out)
}

fn read_len(cur: &mut SliceCursor<'_>) -> RdbResult<Option<usize>> {
    match cur.u8()? {
        END => Ok(None),
        BIG_LEN => Ok(Some(cur.u32_le()? as usize)),
        n => Ok(Some(n as usize)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdb::testutil;

    #[test]
    fn test_pairs_with_free_space() {
        let big = vec![b'v'; 300];
        let zm = testutil::zipmap(&[(&b"name"[..], &b"Ariz"[..]), (&b"bio"[..], &big[..])], 2);
        let got = decode_pairs(&zm).unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], (Bytes::from("name"), Bytes::from("Ariz")));
        assert_eq!(got[1].1.len(), 300);
    }

    #[test]
    fn test_empty() {
        let zm = testutil::zipmap(&[], 0);
        assert!(decode_pairs(&zm).unwrap().is_empty());
    }

    #[test]
    fn test_truncated() {
        let zm = testutil::zipmap(&[(&b"k"[..], &b"v"[..])], 0);
        assert!(decode_pairs(&zm[..zm.len() - 1]).is_err());
    }
}
