//! Binary primitive reader for the RDB format.
//!
//! [`RdbReader`] wraps any `Read` source and never reads past the value it is
//! asked for. Every byte that passes through it is folded into a running
//! CRC-64 so the loader can check the trailing checksum, and can optionally
//! be recorded so the raw encoding of one value can be re-sent as a DUMP
//! payload.
//!
//! ## Length encoding
//!
//! ```text
//! 00xxxxxx                  6-bit length
//! 01xxxxxx xxxxxxxx         14-bit length
//! 10000000 <4 bytes BE>     32-bit length
//! 10000001 <8 bytes BE>     64-bit length
//! 11xxxxxx                  special encoding (int8/16/32 or LZF string)
//! ```

use super::{lzf, RdbError, RdbResult};
use bytes::Bytes;
use crc::{Crc, Digest, CRC_64_REDIS};
use std::io::Read;

pub(crate) static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_LZF: u8 = 3;

/// Raw-byte capture for one value.
struct Recording {
    buf: Vec<u8>,
    limit: usize,
    overflowed: bool,
}

pub struct RdbReader<R> {
    inner: R,
    digest: Digest<'static, u64>,
    position: u64,
    recording: Option<Recording>,
}

impl<R: Read> RdbReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digest: CRC64.digest(),
            position: 0,
            recording: None,
        }
    }

    /// Total bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CRC-64 of everything read so far. Resets the running checksum.
    pub fn take_checksum(&mut self) -> u64 {
        std::mem::replace(&mut self.digest, CRC64.digest()).finalize()
    }

    /// Starts capturing raw bytes, keeping at most `limit` of them.
    pub fn start_recording(&mut self, limit: usize) {
        self.recording = Some(Recording {
            buf: Vec::new(),
            limit,
            overflowed: false,
        });
    }

    /// Stops capturing. Returns `None` if more than `limit` bytes went by.
    pub fn finish_recording(&mut self) -> Option<Vec<u8>> {
        match self.recording.take() {
            Some(rec) if !rec.overflowed => Some(rec.buf),
            _ => None,
        }
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> RdbResult<()> {
        self.inner.read_exact(buf)?;
        self.digest.update(buf);
        self.position += buf.len() as u64;
        if let Some(rec) = self.recording.as_mut() {
            if !rec.overflowed {
                if rec.buf.len() + buf.len() > rec.limit {
                    rec.overflowed = true;
                    rec.buf = Vec::new();
                } else {
                    rec.buf.extend_from_slice(buf);
                }
            }
        }
        Ok(())
    }

    pub fn read_array<const N: usize>(&mut self) -> RdbResult<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_bytes(&mut self, n: usize) -> RdbResult<Vec<u8>> {
        // Grow as data arrives; a corrupt length must not allocate up front.
        let mut out = Vec::with_capacity(n.min(64 * 1024));
        let mut chunk = [0u8; 8192];
        let mut left = n;
        while left > 0 {
            let step = left.min(chunk.len());
            self.read_exact(&mut chunk[..step])?;
            out.extend_from_slice(&chunk[..step]);
            left -= step;
        }
        Ok(out)
    }

    pub fn read_u8(&mut self) -> RdbResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> RdbResult<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> RdbResult<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> RdbResult<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_be(&mut self) -> RdbResult<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Reads a length, reporting whether the special-encoding flag was set.
    ///
    /// When the flag is set the returned value is the 6-bit encoding type.
    pub fn read_encoded_length(&mut self) -> RdbResult<(u64, bool)> {
        let first = self.read_u8()?;
        match first >> 6 {
            0 => Ok(((first & 0x3f) as u64, false)),
            1 => {
                let second = self.read_u8()?;
                Ok(((((first & 0x3f) as u64) << 8) | second as u64, false))
            }
            2 => match first {
                0x80 => Ok((u32::from_be_bytes(self.read_array()?) as u64, false)),
                0x81 => Ok((u64::from_be_bytes(self.read_array()?), false)),
                other => Err(RdbError::EncodedLength(other)),
            },
            _ => Ok(((first & 0x3f) as u64, true)),
        }
    }

    /// Reads a plain length; the special-encoding flag is an error here.
    pub fn read_length(&mut self) -> RdbResult<u64> {
        match self.read_encoded_length()? {
            (len, false) => Ok(len),
            (enc, true) => Err(RdbError::EncodedLength(0xC0 | enc as u8)),
        }
    }

    /// Reads a length that must fit in memory.
    pub fn read_len(&mut self) -> RdbResult<usize> {
        let len = self.read_length()?;
        usize::try_from(len).map_err(|_| RdbError::EncodedLength(0x81))
    }

    /// Reads a string in any of its encodings: raw, integer or LZF.
    pub fn read_string(&mut self) -> RdbResult<Bytes> {
        let (len, special) = self.read_encoded_length()?;
        if !special {
            let len = usize::try_from(len).map_err(|_| RdbError::EncodedLength(0x81))?;
            return Ok(Bytes::from(self.read_bytes(len)?));
        }
        match len as u8 {
            ENC_INT8 => {
                let v = self.read_u8()? as i8;
                Ok(Bytes::from(v.to_string()))
            }
            ENC_INT16 => {
                let v = i16::from_le_bytes(self.read_array()?);
                Ok(Bytes::from(v.to_string()))
            }
            ENC_INT32 => {
                let v = i32::from_le_bytes(self.read_array()?);
                Ok(Bytes::from(v.to_string()))
            }
            ENC_LZF => {
                let compressed_len = self.read_len()?;
                let len = self.read_len()?;
                let compressed = self.read_bytes(compressed_len)?;
                Ok(Bytes::from(lzf::decompress(&compressed, len)?))
            }
            other => Err(RdbError::UnknownStringEncoding(other)),
        }
    }

    /// Reads a string and parses it as an integer.
    pub fn read_string_as_i64(&mut self) -> RdbResult<i64> {
        let s = self.read_string()?;
        std::str::from_utf8(&s)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RdbError::container("integer string", format!("{:?}", s)))
    }

    /// Legacy ASCII float: a length byte followed by the textual value.
    /// 253, 254 and 255 stand for NaN, +inf and -inf.
    pub fn read_float(&mut self) -> RdbResult<f64> {
        let len = self.read_u8()?;
        match len {
            253 => Ok(f64::NAN),
            254 => Ok(f64::INFINITY),
            255 => Ok(f64::NEG_INFINITY),
            n => {
                let raw = self.read_bytes(n as usize)?;
                let text = String::from_utf8_lossy(&raw);
                text.trim()
                    .parse()
                    .map_err(|_| RdbError::InvalidFloat(text.to_string()))
            }
        }
    }

    /// Binary IEEE-754 double, little-endian.
    pub fn read_double(&mut self) -> RdbResult<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Binary IEEE-754 single-precision float, little-endian.
    pub fn read_f32(&mut self) -> RdbResult<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdb::testutil::{encode_length, encode_string};
    use std::io::Cursor;

    fn reader(data: Vec<u8>) -> RdbReader<Cursor<Vec<u8>>> {
        RdbReader::new(Cursor::new(data))
    }

    #[test]
    fn test_length_boundaries() {
        for len in [0u64, 63, 64, 16383, 16384, u32::MAX as u64, u32::MAX as u64 + 1] {
            let encoded = encode_length(len);
            let n = encoded.len();
            let mut rd = reader(encoded);
            assert_eq!(rd.read_length().unwrap(), len, "length {}", len);
            assert_eq!(rd.position(), n as u64);
        }
        assert_eq!(encode_length(63).len(), 1);
        assert_eq!(encode_length(64).len(), 2);
        assert_eq!(encode_length(16383).len(), 2);
        assert_eq!(encode_length(16384).len(), 5);
        assert_eq!(encode_length(u32::MAX as u64 + 1).len(), 9);
    }

    #[test]
    fn test_special_flag_rejected_as_length() {
        let mut rd = reader(vec![0xC0, 0x05]);
        assert!(matches!(rd.read_length(), Err(RdbError::EncodedLength(0xC0))));
    }

    #[test]
    fn test_integer_encoded_strings() {
        let mut rd = reader(vec![
            0xC0, 0xFB, // int8 -5
            0xC1, 0x39, 0x30, // int16 12345
            0xC2, 0x15, 0xCD, 0x5B, 0x07, // int32 123456789
        ]);
        assert_eq!(rd.read_string().unwrap(), Bytes::from("-5"));
        assert_eq!(rd.read_string().unwrap(), Bytes::from("12345"));
        assert_eq!(rd.read_string().unwrap(), Bytes::from("123456789"));
    }

    #[test]
    fn test_lzf_string_with_absurd_length_is_an_error() {
        let mut data = vec![0xC3, 0x01, 0x81];
        data.extend_from_slice(&(1u64 << 63).to_be_bytes());
        data.push(0x00);
        assert!(matches!(reader(data).read_string(), Err(RdbError::Lzf(_))));
    }

    #[test]
    fn test_lzf_string() {
        let original = b"abcdefgh".repeat(32);
        let compressed = ::lzf::compress(&original).unwrap();
        let mut data = vec![0xC3];
        data.extend(encode_length(compressed.len() as u64));
        data.extend(encode_length(original.len() as u64));
        data.extend(&compressed);
        let total = data.len() as u64;

        let mut rd = reader(data);
        assert_eq!(rd.read_string().unwrap(), Bytes::from(original));
        assert_eq!(rd.position(), total);
    }

    #[test]
    fn test_raw_string_at_14_bit_boundary() {
        let value = vec![b'z'; 16384];
        let mut rd = reader(encode_string(&value));
        assert_eq!(rd.read_string().unwrap().len(), 16384);
    }

    #[test]
    fn test_truncated_string_is_io_error() {
        let mut rd = reader(vec![5, b'a', b'b']);
        assert!(matches!(rd.read_string(), Err(RdbError::Io(_))));
    }

    #[test]
    fn test_ascii_float_specials() {
        let mut data = vec![253, 254, 255, 3];
        data.extend_from_slice(b"1.5");
        let mut rd = reader(data);
        assert!(rd.read_float().unwrap().is_nan());
        assert_eq!(rd.read_float().unwrap(), f64::INFINITY);
        assert_eq!(rd.read_float().unwrap(), f64::NEG_INFINITY);
        assert_eq!(rd.read_float().unwrap(), 1.5);
    }

    #[test]
    fn test_recording_respects_limit() {
        let mut rd = reader(vec![1, 2, 3, 4, 5, 6]);
        rd.start_recording(4);
        rd.read_array::<3>().unwrap();
        assert_eq!(rd.finish_recording(), Some(vec![1, 2, 3]));

        rd.start_recording(2);
        rd.read_array::<3>().unwrap();
        assert_eq!(rd.finish_recording(), None);
    }

    #[test]
    fn test_checksum_matches_crc64_of_input() {
        let data = b"REDIS0011".to_vec();
        let mut rd = reader(data.clone());
        rd.read_bytes(data.len()).unwrap();
        assert_eq!(rd.take_checksum(), CRC64.checksum(&data));
    }
}
