//! RESP (Redis Serialization Protocol) Data Types
//!
//! Replies from a master or a target come back as one of the RESP value kinds
//! below. Callers pattern-match on [`RespValue`] instead of casting, and turn
//! any shape they did not expect into an explicit error.
//!
//! ## Protocol Format
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-BUSYKEY Target key name already exists.\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk String: `$5\r\nhello\r\n` (null: `$-1\r\n`)
//! - `*` Array: `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`
//!
//! Commands are always sent as arrays of bulk strings; [`encode_command`]
//! produces that framing directly from an argument vector.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single decoded RESP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`
    SimpleString(String),

    /// `-<error message>\r\n`
    Error(String),

    /// `:<integer>\r\n`
    Integer(i64),

    /// `$<length>\r\n<data>\r\n`, binary safe.
    BulkString(Bytes),

    /// Null bulk string or null array.
    Null,

    /// `*<count>\r\n<element1><element2>...`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Builds the array-of-bulk-strings form of a command.
    pub fn command<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|a| RespValue::BulkString(a.into()))
                .collect(),
        )
    }

    /// Serializes the RESP value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the RESP value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => write_bulk(buf, data),
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Attempts to extract the inner string from SimpleString or BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Converts an array of bulk/simple strings into an argument vector.
    ///
    /// Returns `None` for any other shape, including nested arrays.
    pub fn into_argv(self) -> Option<Vec<Bytes>> {
        let items = self.into_array()?;
        let mut argv = Vec::with_capacity(items.len());
        for item in items {
            match item {
                RespValue::BulkString(b) => argv.push(b),
                RespValue::SimpleString(s) => argv.push(Bytes::from(s)),
                RespValue::Integer(n) => argv.push(Bytes::from(n.to_string())),
                _ => return None,
            }
        }
        Some(argv)
    }
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(prefix::BULK_STRING);
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(data);
    buf.extend_from_slice(CRLF);
}

/// Encodes an argument vector as a RESP array of bulk strings.
pub fn encode_command<T: AsRef<[u8]>>(args: &[T]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(args));
    encode_command_into(args, &mut buf);
    buf
}

pub fn encode_command_into<T: AsRef<[u8]>>(args: &[T], buf: &mut Vec<u8>) {
    buf.push(prefix::ARRAY);
    buf.extend_from_slice(args.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    for arg in args {
        write_bulk(buf, arg.as_ref());
    }
}

/// Exact byte length of [`encode_command`] output, without allocating it.
pub fn encoded_len<T: AsRef<[u8]>>(args: &[T]) -> usize {
    let header = 1 + decimal_len(args.len()) + 2;
    args.iter().fold(header, |acc, arg| {
        let n = arg.as_ref().len();
        acc + 1 + decimal_len(n) + 2 + n + 2
    })
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serialize() {
        let value = RespValue::error("BUSYKEY Target key name already exists.");
        assert_eq!(
            value.serialize(),
            b"-BUSYKEY Target key name already exists.\r\n"
        );
    }

    #[test]
    fn test_null_serialize() {
        assert_eq!(RespValue::null().serialize(), b"$-1\r\n");
    }

    #[test]
    fn test_command_matches_encode_command() {
        let args = [
            Bytes::from("SET"),
            Bytes::from("key"),
            Bytes::from("value"),
        ];
        let via_value = RespValue::command(args.clone()).serialize();
        let direct = encode_command(&args);
        assert_eq!(via_value, direct);
        assert_eq!(direct, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n");
    }

    #[test]
    fn test_encoded_len_is_exact() {
        let long = vec![b'x'; 12345];
        let args: Vec<&[u8]> = vec![b"RESTORE", b"k", b"0", &long];
        assert_eq!(encoded_len(&args), encode_command(&args).len());

        let empty: Vec<&[u8]> = vec![b""];
        assert_eq!(encoded_len(&empty), encode_command(&empty).len());
    }

    #[test]
    fn test_into_argv() {
        let value = RespValue::array(vec![
            RespValue::bulk_string("SELECT"),
            RespValue::integer(3),
        ]);
        assert_eq!(
            value.into_argv(),
            Some(vec![Bytes::from("SELECT"), Bytes::from("3")])
        );

        let nested = RespValue::array(vec![RespValue::array(vec![])]);
        assert_eq!(nested.into_argv(), None);
        assert_eq!(RespValue::ok().into_argv(), None);
    }
}
