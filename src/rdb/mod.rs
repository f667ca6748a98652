//! RDB Snapshot Decoding
//!
//! This module turns the binary RDB snapshot a master sends during a full
//! resynchronization (or an RDB file on disk) into replayable commands.
//!
//! ## Layers
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ loader    opcodes: AUX, SELECTDB, EXPIRE*, IDLE, FREQ, EOF    │
//! │           emits RESTORE / rewrite commands as Entries          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ types     one decoder per Redis type (string, list, ...)       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ ziplist, listpack, intset, zipmap   packed containers          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ reader    lengths, strings, floats, LZF, CRC-64 tracking       │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every layer reads exactly the bytes it owns. Any malformed length, string
//! or container is fatal to the whole stream: once misaligned there is no way
//! to find the next key again.

pub mod cursor;
pub mod dump;
pub mod intset;
pub mod listpack;
pub mod loader;
pub mod lzf;
pub mod reader;
pub mod types;
pub mod ziplist;
pub mod zipmap;

#[cfg(test)]
pub(crate) mod testutil;

pub use loader::{load_all, Loader, LoaderConfig, LoaderSummary, RestorePolicy};
pub use reader::RdbReader;
pub use types::{parse_object, RedisObject, RedisValue};

use thiserror::Error;

/// Errors raised while decoding an RDB stream.
#[derive(Debug, Error)]
pub enum RdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid RDB magic: {0:?}")]
    InvalidMagic(Vec<u8>),

    #[error("invalid RDB version: {0:?}")]
    InvalidVersion(String),

    #[error("unsupported RDB version: {0}")]
    UnsupportedVersion(u32),

    /// A plain length was expected but the special-encoding flag was set
    #[error("unexpected encoded length (flag byte {0:#04x})")]
    EncodedLength(u8),

    #[error("unknown string encoding: {0}")]
    UnknownStringEncoding(u8),

    #[error("LZF decompression failed: {0}")]
    Lzf(String),

    #[error("unknown RDB type: {0}")]
    UnknownType(u8),

    #[error("unsupported RDB opcode: {0}")]
    UnsupportedOpcode(u8),

    #[error("malformed {kind}: {reason}")]
    Container { kind: &'static str, reason: String },

    #[error("invalid float: {0}")]
    InvalidFloat(String),

    #[error("invalid AUX field {key}={value}")]
    InvalidAux { key: String, value: String },

    #[error("unsupported module value: {0}")]
    UnsupportedModule(String),

    #[error("checksum mismatch: expected {expected:#018x}, computed {actual:#018x}")]
    ChecksumMismatch { expected: u64, actual: u64 },

    /// The consumer of decoded entries went away
    #[error("entry sink closed")]
    SinkClosed,
}

impl RdbError {
    pub(crate) fn container(kind: &'static str, reason: impl Into<String>) -> Self {
        RdbError::Container {
            kind,
            reason: reason.into(),
        }
    }
}

pub type RdbResult<T> = Result<T, RdbError>;

/// Highest RDB version this decoder understands (Redis 7.2+).
pub const MAX_RDB_VERSION: u32 = 12;

/// Top-level opcodes.
pub mod opcode {
    pub const SLOT_INFO: u8 = 244;
    pub const FUNCTION2: u8 = 245;
    pub const FUNCTION: u8 = 246;
    pub const MODULE_AUX: u8 = 247;
    pub const IDLE: u8 = 0xF8;
    pub const FREQ: u8 = 0xF9;
    pub const AUX: u8 = 0xFA;
    pub const RESIZEDB: u8 = 0xFB;
    pub const EXPIRETIME_MS: u8 = 0xFC;
    pub const EXPIRETIME: u8 = 0xFD;
    pub const SELECTDB: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
}

/// Object type tags.
pub mod kind {
    pub const STRING: u8 = 0;
    pub const LIST: u8 = 1;
    pub const SET: u8 = 2;
    pub const ZSET: u8 = 3;
    pub const HASH: u8 = 4;
    pub const ZSET_2: u8 = 5;
    pub const MODULE: u8 = 6;
    pub const MODULE_2: u8 = 7;
    pub const HASH_ZIPMAP: u8 = 9;
    pub const LIST_ZIPLIST: u8 = 10;
    pub const SET_INTSET: u8 = 11;
    pub const ZSET_ZIPLIST: u8 = 12;
    pub const HASH_ZIPLIST: u8 = 13;
    pub const LIST_QUICKLIST: u8 = 14;
    pub const STREAM_LISTPACKS: u8 = 15;
    pub const HASH_LISTPACK: u8 = 16;
    pub const ZSET_LISTPACK: u8 = 17;
    pub const LIST_QUICKLIST_2: u8 = 18;
    pub const STREAM_LISTPACKS_2: u8 = 19;
    pub const SET_LISTPACK: u8 = 20;
    pub const STREAM_LISTPACKS_3: u8 = 21;
}
