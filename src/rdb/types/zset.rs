use super::{format_double, Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::{kind, listpack, ziplist, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;

/// A sorted set. Scores are kept in their textual ZADD form.
#[derive(Debug, Clone, PartialEq)]
pub struct ZSetObject {
    pub key: Bytes,
    pub members: Vec<(Bytes, Bytes)>,
}

impl RedisObject for ZSetObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        let members = match type_byte {
            kind::ZSET | kind::ZSET_2 => {
                let n = rd.read_len()?;
                let mut out = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    let member = rd.read_string()?;
                    let score = if type_byte == kind::ZSET_2 {
                        rd.read_double()?
                    } else {
                        rd.read_float()?
                    };
                    out.push((member, format_double(score)));
                }
                out
            }
            kind::ZSET_ZIPLIST => ziplist::decode_pairs(&rd.read_string()?)?,
            kind::ZSET_LISTPACK => listpack::decode_pairs(&rd.read_string()?)?,
            other => return Err(RdbError::UnknownType(other)),
        };
        Ok(Self { key, members })
    }

    fn rewrite(&self) -> Vec<Command> {
        self.members
            .iter()
            .map(|(member, score)| {
                vec![
                    Bytes::from_static(b"ZADD"),
                    self.key.clone(),
                    score.clone(),
                    member.clone(),
                ]
            })
            .collect()
    }
}
