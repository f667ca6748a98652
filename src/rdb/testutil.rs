//! Test-only RDB encoder used to build fixtures.

use super::opcode;
use super::reader::CRC64;

pub fn encode_length(len: u64) -> Vec<u8> {
    if len < 64 {
        vec![len as u8]
    } else if len < 16384 {
        vec![0x40 | (len >> 8) as u8, len as u8]
    } else if len <= u32::MAX as u64 {
        let mut out = vec![0x80];
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out
    } else {
        let mut out = vec![0x81];
        out.extend_from_slice(&len.to_be_bytes());
        out
    }
}

pub fn encode_string(s: &[u8]) -> Vec<u8> {
    let mut out = encode_length(s.len() as u64);
    out.extend_from_slice(s);
    out
}

fn canonical_int(s: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(s).ok()?;
    let v: i64 = text.parse().ok()?;
    (v.to_string() == text).then_some(v)
}

fn ziplist_entry(prev_len: usize, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if prev_len < 254 {
        out.push(prev_len as u8);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&(prev_len as u32).to_le_bytes());
    }

    if let Some(v) = canonical_int(value) {
        if (0..=12).contains(&v) {
            out.push(0xF1 + v as u8);
        } else if i8::try_from(v).is_ok() {
            out.push(0xFE);
            out.push(v as i8 as u8);
        } else if i16::try_from(v).is_ok() {
            out.push(0xC0);
            out.extend_from_slice(&(v as i16).to_le_bytes());
        } else if (-(1 << 23)..(1 << 23)).contains(&v) {
            out.push(0xF0);
            out.extend_from_slice(&(v as i32).to_le_bytes()[..3]);
        } else if i32::try_from(v).is_ok() {
            out.push(0xD0);
            out.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            out.push(0xE0);
            out.extend_from_slice(&v.to_le_bytes());
        }
        return out;
    }

    let len = value.len();
    if len < 64 {
        out.push(len as u8);
    } else if len < 16384 {
        out.push(0x40 | (len >> 8) as u8);
        out.push(len as u8);
    } else {
        out.push(0x80);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
    out.extend_from_slice(value);
    out
}

/// Builds a ziplist, writing `zllen` as the declared count.
pub fn ziplist_with_count<T: AsRef<[u8]>>(items: &[T], zllen: u16) -> Vec<u8> {
    let mut body = Vec::new();
    let mut prev_len = 0;
    let mut tail = 10;
    for item in items {
        tail = 10 + body.len();
        let entry = ziplist_entry(prev_len, item.as_ref());
        prev_len = entry.len();
        body.extend(entry);
    }
    let total = 10 + body.len() + 1;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(tail as u32).to_le_bytes());
    out.extend_from_slice(&zllen.to_le_bytes());
    out.extend(body);
    out.push(0xFF);
    out
}

pub fn ziplist<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let count = items.len().min(u16::MAX as usize) as u16;
    ziplist_with_count(items, count)
}

fn listpack_backlen(len: usize) -> Vec<u8> {
    let n = if len <= 127 {
        1
    } else if len < 16383 {
        2
    } else if len < 2097151 {
        3
    } else if len < 268435455 {
        4
    } else {
        5
    };
    let mut out = vec![(len >> (7 * (n - 1))) as u8];
    for i in 1..n {
        out.push(((len >> (7 * (n - 1 - i))) & 127) as u8 | 128);
    }
    out
}

fn listpack_entry(value: &[u8]) -> Vec<u8> {
    let mut enc = Vec::new();
    if let Some(v) = canonical_int(value) {
        if (0..=127).contains(&v) {
            enc.push(v as u8);
        } else if (-4096..=4095).contains(&v) {
            let uv = (v as u64) & 0x1FFF;
            enc.push(0xC0 | (uv >> 8) as u8);
            enc.push(uv as u8);
        } else if i16::try_from(v).is_ok() {
            enc.push(0xF1);
            enc.extend_from_slice(&(v as i16).to_le_bytes());
        } else if (-(1 << 23)..(1 << 23)).contains(&v) {
            enc.push(0xF2);
            enc.extend_from_slice(&(v as i32).to_le_bytes()[..3]);
        } else if i32::try_from(v).is_ok() {
            enc.push(0xF3);
            enc.extend_from_slice(&(v as i32).to_le_bytes());
        } else {
            enc.push(0xF4);
            enc.extend_from_slice(&v.to_le_bytes());
        }
    } else {
        let len = value.len();
        if len < 64 {
            enc.push(0x80 | len as u8);
        } else if len < 4096 {
            enc.push(0xE0 | (len >> 8) as u8);
            enc.push(len as u8);
        } else {
            enc.push(0xF0);
            enc.extend_from_slice(&(len as u32).to_le_bytes());
        }
        enc.extend_from_slice(value);
    }
    let back = listpack_backlen(enc.len());
    enc.extend(back);
    enc
}

pub fn listpack<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        body.extend(listpack_entry(item.as_ref()));
    }
    let total = 6 + body.len() + 1;
    let count = items.len().min(u16::MAX as usize) as u16;
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend(body);
    out.push(0xFF);
    out
}

pub fn intset(width: u32, values: &[i64]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        match width {
            2 => out.extend_from_slice(&(*v as i16).to_le_bytes()),
            4 => out.extend_from_slice(&(*v as i32).to_le_bytes()),
            _ => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    out
}

fn zipmap_len(out: &mut Vec<u8>, len: usize) {
    if len < 254 {
        out.push(len as u8);
    } else {
        out.push(254);
        out.extend_from_slice(&(len as u32).to_le_bytes());
    }
}

/// Builds a zipmap; each value carries `free` trailing unused bytes.
pub fn zipmap(pairs: &[(&[u8], &[u8])], free: u8) -> Vec<u8> {
    let mut out = vec![pairs.len().min(254) as u8];
    for (k, v) in pairs {
        zipmap_len(&mut out, k.len());
        out.extend_from_slice(k);
        zipmap_len(&mut out, v.len());
        out.push(free);
        out.extend_from_slice(v);
        out.extend(std::iter::repeat(0u8).take(free as usize));
    }
    out.push(0xFF);
    out
}

/// Encodes a sequence of plain RDB strings (list, set and hash bodies).
pub fn string_seq<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        out.extend(encode_string(item.as_ref()));
    }
    out
}

/// Builds a whole RDB stream.
pub struct RdbBuilder {
    buf: Vec<u8>,
}

impl RdbBuilder {
    pub fn new(version: u32) -> Self {
        Self {
            buf: format!("REDIS{:04}", version).into_bytes(),
        }
    }

    pub fn aux(mut self, key: &str, value: &str) -> Self {
        self.buf.push(opcode::AUX);
        self.buf.extend(encode_string(key.as_bytes()));
        self.buf.extend(encode_string(value.as_bytes()));
        self
    }

    pub fn select_db(mut self, db: u64) -> Self {
        self.buf.push(opcode::SELECTDB);
        self.buf.extend(encode_length(db));
        self
    }

    pub fn resize_db(mut self, size: u64, expires: u64) -> Self {
        self.buf.push(opcode::RESIZEDB);
        self.buf.extend(encode_length(size));
        self.buf.extend(encode_length(expires));
        self
    }

    pub fn expire_ms(mut self, at_ms: u64) -> Self {
        self.buf.push(opcode::EXPIRETIME_MS);
        self.buf.extend_from_slice(&at_ms.to_le_bytes());
        self
    }

    pub fn idle(mut self, seconds: u64) -> Self {
        self.buf.push(opcode::IDLE);
        self.buf.extend(encode_length(seconds));
        self
    }

    pub fn freq(mut self, freq: u8) -> Self {
        self.buf.push(opcode::FREQ);
        self.buf.push(freq);
        self
    }

    /// Adds a key whose value is already encoded for `type_byte`.
    pub fn key(mut self, type_byte: u8, key: &[u8], value: &[u8]) -> Self {
        self.buf.push(type_byte);
        self.buf.extend(encode_string(key));
        self.buf.extend_from_slice(value);
        self
    }

    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Appends EOF and the CRC-64 trailer.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(opcode::EOF);
        let crc = CRC64.checksum(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }

    /// Appends EOF and a zero trailer (checksums disabled).
    pub fn finish_unchecked(mut self) -> Vec<u8> {
        self.buf.push(opcode::EOF);
        self.buf.extend_from_slice(&[0u8; 8]);
        self.buf
    }
}
