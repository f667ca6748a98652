//! Lists: plain, ziplist, quicklist (ziplist nodes) and quicklist2
//! (plain or listpack nodes).

use super::{Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::{kind, listpack, ziplist, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;

const QUICKLIST_NODE_PLAIN: u64 = 1;
const QUICKLIST_NODE_PACKED: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ListObject {
    pub key: Bytes,
    pub elements: Vec<Bytes>,
}

impl RedisObject for ListObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        let elements = match type_byte {
            kind::LIST => {
                let n = rd.read_len()?;
                let mut out = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    out.push(rd.read_string()?);
                }
                out
            }
            kind::LIST_ZIPLIST => ziplist::decode(&rd.read_string()?)?,
            kind::LIST_QUICKLIST => {
                let nodes = rd.read_len()?;
                let mut out = Vec::new();
                for _ in 0..nodes {
                    out.extend(ziplist::decode(&rd.read_string()?)?);
                }
                out
            }
            kind::LIST_QUICKLIST_2 => {
                let nodes = rd.read_len()?;
                let mut out = Vec::new();
                for _ in 0..nodes {
                    match rd.read_length()? {
                        QUICKLIST_NODE_PLAIN => out.push(rd.read_string()?),
                        QUICKLIST_NODE_PACKED => out.extend(listpack::decode(&rd.read_string()?)?),
                        other => {
                            return Err(RdbError::container(
                                "quicklist",
                                format!("unknown node container {}", other),
                            ))
                        }
                    }
                }
                out
            }
            other => return Err(RdbError::UnknownType(other)),
        };
        Ok(Self { key, elements })
    }

    fn rewrite(&self) -> Vec<Command> {
        self.elements
            .iter()
            .map(|e| vec![Bytes::from_static(b"RPUSH"), self.key.clone(), e.clone()])
            .collect()
    }
}
