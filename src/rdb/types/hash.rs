use super::{Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::{kind, listpack, ziplist, zipmap, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;

#[derive(Debug, Clone, PartialEq)]
pub struct HashObject {
    pub key: Bytes,
    pub fields: Vec<(Bytes, Bytes)>,
}

impl RedisObject for HashObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        let fields = match type_byte {
            kind::HASH => {
                let n = rd.read_len()?;
                let mut out = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    let field = rd.read_string()?;
                    let value = rd.read_string()?;
                    out.push((field, value));
                }
                out
            }
            kind::HASH_ZIPMAP => zipmap::decode_pairs(&rd.read_string()?)?,
            kind::HASH_ZIPLIST => ziplist::decode_pairs(&rd.read_string()?)?,
            kind::HASH_LISTPACK => listpack::decode_pairs(&rd.read_string()?)?,
            other => return Err(RdbError::UnknownType(other)),
        };
        Ok(Self { key, fields })
    }

    fn rewrite(&self) -> Vec<Command> {
        self.fields
            .iter()
            .map(|(field, value)| {
                vec![
                    Bytes::from_static(b"HSET"),
                    self.key.clone(),
                    field.clone(),
                    value.clone(),
                ]
            })
            .collect()
    }
}
