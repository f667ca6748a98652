//! Object decoders, one per Redis type.
//!
//! Each decoder reads its value from an [`RdbReader`] positioned right after
//! the key, and can rewrite the value as a sequence of plain write commands
//! (`RPUSH`, `HSET`, `XADD`, ...). The loader uses the rewrite for values too
//! large to send as one RESTORE payload and for module values, which have no
//! portable DUMP form.

pub mod hash;
pub mod list;
pub mod module;
pub mod set;
pub mod stream;
pub mod string;
pub mod zset;

pub use hash::HashObject;
pub use list::ListObject;
pub use module::ModuleObject;
pub use set::SetObject;
pub use stream::StreamObject;
pub use string::StringObject;
pub use zset::ZSetObject;

use super::reader::RdbReader;
use super::{kind, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;

/// One rewritten command: an argument vector.
pub type Command = Vec<Bytes>;

/// A decoded RDB value.
pub trait RedisObject: Sized {
    /// Decodes the value for `key` encoded as `type_byte`.
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self>;

    /// Commands that recreate the value on an empty key.
    fn rewrite(&self) -> Vec<Command>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedisValue {
    String(StringObject),
    List(ListObject),
    Set(SetObject),
    ZSet(ZSetObject),
    Hash(HashObject),
    Stream(StreamObject),
    Module(ModuleObject),
}

impl RedisValue {
    pub fn rewrite(&self) -> Vec<Command> {
        match self {
            RedisValue::String(o) => o.rewrite(),
            RedisValue::List(o) => o.rewrite(),
            RedisValue::Set(o) => o.rewrite(),
            RedisValue::ZSet(o) => o.rewrite(),
            RedisValue::Hash(o) => o.rewrite(),
            RedisValue::Stream(o) => o.rewrite(),
            RedisValue::Module(o) => o.rewrite(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RedisValue::String(_) => "string",
            RedisValue::List(_) => "list",
            RedisValue::Set(_) => "set",
            RedisValue::ZSet(_) => "zset",
            RedisValue::Hash(_) => "hash",
            RedisValue::Stream(_) => "stream",
            RedisValue::Module(_) => "module",
        }
    }
}

/// Decodes one value, dispatching on its type tag.
pub fn parse_object<R: Read>(
    rd: &mut RdbReader<R>,
    type_byte: u8,
    key: Bytes,
) -> RdbResult<RedisValue> {
    let value = match type_byte {
        kind::STRING => RedisValue::String(StringObject::load(rd, type_byte, key)?),
        kind::LIST | kind::LIST_ZIPLIST | kind::LIST_QUICKLIST | kind::LIST_QUICKLIST_2 => {
            RedisValue::List(ListObject::load(rd, type_byte, key)?)
        }
        kind::SET | kind::SET_INTSET | kind::SET_LISTPACK => {
            RedisValue::Set(SetObject::load(rd, type_byte, key)?)
        }
        kind::ZSET | kind::ZSET_2 | kind::ZSET_ZIPLIST | kind::ZSET_LISTPACK => {
            RedisValue::ZSet(ZSetObject::load(rd, type_byte, key)?)
        }
        kind::HASH | kind::HASH_ZIPMAP | kind::HASH_ZIPLIST | kind::HASH_LISTPACK => {
            RedisValue::Hash(HashObject::load(rd, type_byte, key)?)
        }
        kind::STREAM_LISTPACKS | kind::STREAM_LISTPACKS_2 | kind::STREAM_LISTPACKS_3 => {
            RedisValue::Stream(StreamObject::load(rd, type_byte, key)?)
        }
        kind::MODULE | kind::MODULE_2 => {
            RedisValue::Module(ModuleObject::load(rd, type_byte, key)?)
        }
        other => return Err(RdbError::UnknownType(other)),
    };
    Ok(value)
}

/// Formats a score the way ZADD accepts it back.
pub(crate) fn format_double(v: f64) -> Bytes {
    if v.is_infinite() {
        return Bytes::from_static(if v > 0.0 { b"inf" } else { b"-inf" });
    }
    Bytes::from(v.to_string())
}
