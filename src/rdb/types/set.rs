use super::{Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::{intset, kind, listpack, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;

#[derive(Debug, Clone, PartialEq)]
pub struct SetObject {
    pub key: Bytes,
    pub members: Vec<Bytes>,
}

impl RedisObject for SetObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        let members = match type_byte {
            kind::SET => {
                let n = rd.read_len()?;
                let mut out = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    out.push(rd.read_string()?);
                }
                out
            }
            kind::SET_INTSET => intset::decode(&rd.read_string()?)?,
            kind::SET_LISTPACK => listpack::decode(&rd.read_string()?)?,
            other => return Err(RdbError::UnknownType(other)),
        };
        Ok(Self { key, members })
    }

    fn rewrite(&self) -> Vec<Command> {
        self.members
            .iter()
            .map(|m| vec![Bytes::from_static(b"SADD"), self.key.clone(), m.clone()])
            .collect()
    }
}
