//! Bounds-checked cursor over an in-memory packed container.

use super::{RdbError, RdbResult};

pub(crate) struct SliceCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> SliceCursor<'a> {
    pub fn new(buf: &'a [u8], kind: &'static str) -> Self {
        Self { buf, pos: 0, kind }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn error(&self, reason: impl Into<String>) -> RdbError {
        RdbError::container(self.kind, format!("{} at offset {}", reason.into(), self.pos))
    }

    pub fn take(&mut self, n: usize) -> RdbResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(self.error(format!("need {} bytes, {} left", n, self.remaining())));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> RdbResult<()> {
        self.take(n).map(|_| ())
    }

    pub fn peek(&self) -> RdbResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end"))
    }

    pub fn u8(&mut self) -> RdbResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn array<const N: usize>(&mut self) -> RdbResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u16_le(&mut self) -> RdbResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32_le(&mut self) -> RdbResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u32_be(&mut self) -> RdbResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn i16_le(&mut self) -> RdbResult<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn i32_le(&mut self) -> RdbResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i64_le(&mut self) -> RdbResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// Signed 24-bit little-endian integer.
    pub fn i24_le(&mut self) -> RdbResult<i32> {
        let b = self.array::<3>()?;
        Ok(i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_past_end_is_error() {
        let mut cur = SliceCursor::new(&[1, 2, 3], "ziplist");
        assert_eq!(cur.take(2).unwrap(), &[1, 2]);
        let err = cur.take(2).unwrap_err();
        assert!(err.to_string().contains("ziplist"));
    }

    #[test]
    fn test_i24_sign_extension() {
        let mut cur = SliceCursor::new(&[0xFF, 0xFF, 0xFF, 0x01, 0x00, 0x80], "test");
        assert_eq!(cur.i24_le().unwrap(), -1);
        assert_eq!(cur.i24_le().unwrap(), -8388607);
    }
}
