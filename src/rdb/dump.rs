//! DUMP payloads for RESTORE.
//!
//! ```text
//! <type byte><value bytes as stored in the RDB><rdb version u16 LE><crc64 LE>
//! ```
//!
//! The CRC-64 covers everything before it.

use super::reader::CRC64;
use bytes::{BufMut, Bytes, BytesMut};

pub fn payload(type_byte: u8, value: &[u8], rdb_version: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + value.len() + 10);
    buf.put_u8(type_byte);
    buf.put_slice(value);
    buf.put_u16_le(rdb_version);
    let crc = CRC64.checksum(&buf);
    buf.put_u64_le(crc);
    buf.freeze()
}

/// Checks the trailer of a DUMP payload.
pub fn verify(payload: &[u8]) -> bool {
    if payload.len() < 11 {
        return false;
    }
    let (body, trailer) = payload.split_at(payload.len() - 8);
    let mut crc = [0u8; 8];
    crc.copy_from_slice(trailer);
    CRC64.checksum(body) == u64::from_le_bytes(crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let p = payload(0, b"\x01v", 11);
        assert_eq!(p[0], 0);
        assert_eq!(&p[1..3], b"\x01v");
        assert_eq!(&p[3..5], &11u16.to_le_bytes());
        assert_eq!(p.len(), 13);
        assert!(verify(&p));
    }

    #[test]
    fn test_known_redis_dump() {
        // DUMP of SET foo bar on Redis 7.0 (RDB version 10).
        let p = payload(0, b"\x03bar", 10);
        assert_eq!(&p[..7], b"\x00\x03bar\x0a\x00");
        assert!(verify(&p));
    }

    #[test]
    fn test_corruption_detected() {
        let mut p = payload(0, b"\x01v", 9).to_vec();
        p[1] ^= 0xFF;
        assert!(!verify(&p));
    }
}
