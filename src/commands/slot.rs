//! Cluster hash slots: CRC16/XMODEM of the key (or of its `{hashtag}`)
//! modulo 16384.

use crc::{Crc, CRC_16_XMODEM};

pub const SLOT_COUNT: usize = 16384;

static CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Returns the part of `key` that is hashed.
///
/// That is the content of the first `{...}` when it is non-empty, otherwise
/// the whole key.
pub fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(len) = key[open + 1..].iter().position(|&b| b == b'}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

pub fn key_slot(key: &[u8]) -> u16 {
    CRC16.checksum(hash_tag(key)) & (SLOT_COUNT as u16 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(CRC16.checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_known_slots() {
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b""), 0);
    }

    #[test]
    fn test_hashtag_equivalence() {
        for key in ["user:101", "a", "session", "x{y"] {
            let wrapped = format!("prefix{{{}}}suffix", key);
            if key.contains('}') || key.is_empty() {
                continue;
            }
            assert_eq!(key_slot(key.as_bytes()), key_slot(wrapped.as_bytes()), "{}", key);
        }
    }

    #[test]
    fn test_hashtag_edge_cases() {
        assert_eq!(hash_tag(b"{}key"), b"{}key");
        assert_eq!(hash_tag(b"{a}{b}"), b"a");
        assert_eq!(hash_tag(b"no}brace{"), b"no}brace{");
        assert_eq!(hash_tag(b"x{{y}"), b"{y");
    }
}
