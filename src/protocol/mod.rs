//! RESP Protocol Implementation
//!
//! - `types`: the tagged [`RespValue`] reply type and command encoding
//! - `parser`: incremental parser used for master command streams and
//!   target replies
//!
//! ## Example
//!
//! ```
//! use flashsync::protocol::{encode_command, parse_message, RespValue};
//!
//! let wire = encode_command(&["SET", "k", "v"]);
//! let (value, consumed) = parse_message(&wire).unwrap().unwrap();
//! assert_eq!(consumed, wire.len());
//! assert_eq!(value, RespValue::command(["SET", "k", "v"]));
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::{encode_command, encode_command_into, encoded_len, RespValue};
