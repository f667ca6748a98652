//! Streams (listpack encoded, versions 1 to 3).
//!
//! Entries live in listpacks keyed by a 16-byte master ID. Each listpack
//! starts with a master entry:
//!
//! ```text
//! +-------+---------+------------+---------+-----+---------+---+
//! | count | deleted | num-fields | field_1 | ... | field_N | 0 |
//! +-------+---------+------------+---------+-----+---------+---+
//! ```
//!
//! followed by entries whose IDs are deltas against the master ID:
//!
//! ```text
//! +-------+--------+--------+------------+---------+---------+-----+----------+
//! | flags | ms-off | seq-off| num-fields | field_1 | value_1 | ... | lp-count |
//! +-------+--------+--------+------------+---------+---------+-----+----------+
//! ```
//!
//! With the SAMEFIELDS flag the field names are omitted and taken from the
//! master entry.
//!
//! The rewrite recreates entries with XADD, restores the last ID with
//! XSETID, then groups with XGROUP CREATE and pending entries with
//! XCLAIM ... JUSTID FORCE.

use super::{Command, RedisObject};
use crate::rdb::cursor::SliceCursor;
use crate::rdb::reader::RdbReader;
use crate::rdb::{kind, listpack, RdbError, RdbResult};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;

const FLAG_DELETED: i64 = 1;
const FLAG_SAMEFIELDS: i64 = 2;

/// Throwaway group used to create an empty stream whose last ID is 0-0.
const EMPTY_STREAM_GROUP: &[u8] = b"flashsync-empty";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Decodes the 16-byte big-endian form used for keys and PEL entries.
    fn from_raw(raw: &[u8]) -> RdbResult<Self> {
        let mut cur = SliceCursor::new(raw, "stream id");
        let ms = u64::from_be_bytes(cur.array()?);
        let seq = u64::from_be_bytes(cur.array()?);
        if cur.remaining() != 0 {
            return Err(cur.error(format!("expected 16 bytes, got {}", raw.len())));
        }
        Ok(Self { ms, seq })
    }

    fn to_bytes(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Vec<(Bytes, Bytes)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: StreamId,
    pub delivery_time: u64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub name: Bytes,
    pub seen_time: u64,
    pub active_time: Option<u64>,
    pub pending: Vec<StreamId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerGroup {
    pub name: Bytes,
    pub last_id: StreamId,
    pub entries_read: Option<u64>,
    pub pending: Vec<PendingEntry>,
    pub consumers: Vec<Consumer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamObject {
    pub key: Bytes,
    pub entries: Vec<StreamEntry>,
    pub length: u64,
    pub last_id: StreamId,
    pub first_id: Option<StreamId>,
    pub max_deleted_id: Option<StreamId>,
    pub entries_added: Option<u64>,
    pub groups: Vec<ConsumerGroup>,
}

impl RedisObject for StreamObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        if !matches!(
            type_byte,
            kind::STREAM_LISTPACKS | kind::STREAM_LISTPACKS_2 | kind::STREAM_LISTPACKS_3
        ) {
            return Err(RdbError::UnknownType(type_byte));
        }
        let v2 = type_byte >= kind::STREAM_LISTPACKS_2;
        let v3 = type_byte >= kind::STREAM_LISTPACKS_3;

        let mut entries = Vec::new();
        let listpacks = rd.read_len()?;
        for _ in 0..listpacks {
            let master = StreamId::from_raw(&rd.read_string()?)?;
            let lp = listpack::decode(&rd.read_string()?)?;
            decode_listpack(master, lp, &mut entries)?;
        }

        let length = rd.read_length()?;
        let last_id = read_id(rd)?;
        let (first_id, max_deleted_id, entries_added) = if v2 {
            let first = read_id(rd)?;
            let max_deleted = read_id(rd)?;
            let added = rd.read_length()?;
            (Some(first), Some(max_deleted), Some(added))
        } else {
            (None, None, None)
        };

        let group_count = rd.read_len()?;
        let mut groups = Vec::with_capacity(group_count.min(1024));
        for _ in 0..group_count {
            let name = rd.read_string()?;
            let last_id = read_id(rd)?;
            let entries_read = if v2 { Some(rd.read_length()?) } else { None };

            let pel_size = rd.read_len()?;
            let mut pending = Vec::with_capacity(pel_size.min(4096));
            for _ in 0..pel_size {
                let id = StreamId::from_raw(&rd.read_array::<16>()?)?;
                let delivery_time = rd.read_u64_le()?;
                let delivery_count = rd.read_length()?;
                pending.push(PendingEntry {
                    id,
                    delivery_time,
                    delivery_count,
                });
            }

            let consumer_count = rd.read_len()?;
            let mut consumers = Vec::with_capacity(consumer_count.min(1024));
            for _ in 0..consumer_count {
                let name = rd.read_string()?;
                let seen_time = rd.read_u64_le()?;
                let active_time = if v3 { Some(rd.read_u64_le()?) } else { None };
                let n = rd.read_len()?;
                let mut ids = Vec::with_capacity(n.min(4096));
                for _ in 0..n {
                    ids.push(StreamId::from_raw(&rd.read_array::<16>()?)?);
                }
                consumers.push(Consumer {
                    name,
                    seen_time,
                    active_time,
                    pending: ids,
                });
            }

            groups.push(ConsumerGroup {
                name,
                last_id,
                entries_read,
                pending,
                consumers,
            });
        }

        Ok(Self {
            key,
            entries,
            length,
            last_id,
            first_id,
            max_deleted_id,
            entries_added,
            groups,
        })
    }

    fn rewrite(&self) -> Vec<Command> {
        let mut cmds = Vec::with_capacity(self.entries.len() + 2);
        let last_id = self.last_id.to_bytes();

        for entry in &self.entries {
            let mut cmd = Vec::with_capacity(3 + entry.fields.len() * 2);
            cmd.push(Bytes::from_static(b"XADD"));
            cmd.push(self.key.clone());
            cmd.push(entry.id.to_bytes());
            for (f, v) in &entry.fields {
                cmd.push(f.clone());
                cmd.push(v.clone());
            }
            cmds.push(cmd);
        }

        // XADD refuses 0-0, so an empty stream that never held an entry is
        // created through XGROUP CREATE ... MKSTREAM instead.
        let never_written = self.entries.is_empty() && self.last_id == StreamId::default();
        if never_written && self.groups.is_empty() {
            cmds.push(vec![
                Bytes::from_static(b"XGROUP"),
                Bytes::from_static(b"CREATE"),
                self.key.clone(),
                Bytes::from_static(EMPTY_STREAM_GROUP),
                Bytes::from_static(b"0-0"),
                Bytes::from_static(b"MKSTREAM"),
            ]);
            cmds.push(vec![
                Bytes::from_static(b"XGROUP"),
                Bytes::from_static(b"DESTROY"),
                self.key.clone(),
                Bytes::from_static(EMPTY_STREAM_GROUP),
            ]);
        } else if self.entries.is_empty() && !never_written {
            // XADD MAXLEN 0 creates the key and leaves it empty.
            cmds.push(vec![
                Bytes::from_static(b"XADD"),
                self.key.clone(),
                Bytes::from_static(b"MAXLEN"),
                Bytes::from_static(b"0"),
                last_id.clone(),
                Bytes::from_static(b"x"),
                Bytes::from_static(b"y"),
            ]);
        }

        if !never_written {
            cmds.push(vec![
                Bytes::from_static(b"XSETID"),
                self.key.clone(),
                last_id,
            ]);
        }

        for (i, group) in self.groups.iter().enumerate() {
            let mut create = vec![
                Bytes::from_static(b"XGROUP"),
                Bytes::from_static(b"CREATE"),
                self.key.clone(),
                group.name.clone(),
                group.last_id.to_bytes(),
            ];
            if never_written && i == 0 {
                create.push(Bytes::from_static(b"MKSTREAM"));
            }
            cmds.push(create);

            let pel: HashMap<StreamId, &PendingEntry> =
                group.pending.iter().map(|p| (p.id, p)).collect();
            for consumer in &group.consumers {
                for id in &consumer.pending {
                    let (time, count) = pel
                        .get(id)
                        .map(|p| (p.delivery_time, p.delivery_count))
                        .unwrap_or((0, 0));
                    cmds.push(vec![
                        Bytes::from_static(b"XCLAIM"),
                        self.key.clone(),
                        group.name.clone(),
                        consumer.name.clone(),
                        Bytes::from_static(b"0"),
                        id.to_bytes(),
                        Bytes::from_static(b"TIME"),
                        Bytes::from(time.to_string()),
                        Bytes::from_static(b"RETRYCOUNT"),
                        Bytes::from(count.to_string()),
                        Bytes::from_static(b"JUSTID"),
                        Bytes::from_static(b"FORCE"),
                    ]);
                }
            }
        }
        cmds
    }
}

fn read_id<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<StreamId> {
    let ms = rd.read_length()?;
    let seq = rd.read_length()?;
    Ok(StreamId { ms, seq })
}

/// Pulls integers and strings out of a decoded stream listpack.
struct Elements {
    iter: std::vec::IntoIter<Bytes>,
}

impl Elements {
    fn next(&mut self) -> RdbResult<Bytes> {
        self.iter
            .next()
            .ok_or_else(|| RdbError::container("stream listpack", "unexpected end"))
    }

    fn next_int(&mut self) -> RdbResult<i64> {
        let raw = self.next()?;
        std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                RdbError::container("stream listpack", format!("expected integer, got {:?}", raw))
            })
    }

    fn next_count(&mut self) -> RdbResult<usize> {
        let v = self.next_int()?;
        usize::try_from(v)
            .map_err(|_| RdbError::container("stream listpack", format!("negative count {}", v)))
    }
}

fn decode_listpack(master: StreamId, lp: Vec<Bytes>, out: &mut Vec<StreamEntry>) -> RdbResult<()> {
    let mut el = Elements {
        iter: lp.into_iter(),
    };

    let mut count = el.next_int()?;
    let mut deleted = el.next_int()?;
    let master_fields_len = el.next_count()?;
    let mut master_fields = Vec::with_capacity(master_fields_len.min(1024));
    for _ in 0..master_fields_len {
        master_fields.push(el.next()?);
    }
    if el.next_int()? != 0 {
        return Err(RdbError::container(
            "stream listpack",
            "master entry not terminated by 0",
        ));
    }

    while count > 0 || deleted > 0 {
        let flags = el.next_int()?;
        let ms = master.ms.wrapping_add(el.next_int()? as u64);
        let seq = master.seq.wrapping_add(el.next_int()? as u64);

        let mut fields = Vec::new();
        if flags & FLAG_SAMEFIELDS != 0 {
            for field in &master_fields {
                fields.push((field.clone(), el.next()?));
            }
        } else {
            let n = el.next_count()?;
            for _ in 0..n {
                let f = el.next()?;
                let v = el.next()?;
                fields.push((f, v));
            }
        }
        let _lp_count = el.next()?;

        if flags & FLAG_DELETED != 0 {
            deleted -= 1;
        } else {
            count -= 1;
            out.push(StreamEntry {
                id: StreamId { ms, seq },
                fields,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdb::testutil::{encode_length, encode_string, listpack};
    use std::io::Cursor;

    fn raw_id(ms: u64, seq: u64) -> Vec<u8> {
        let mut out = ms.to_be_bytes().to_vec();
        out.extend_from_slice(&seq.to_be_bytes());
        out
    }

    /// Master 1000-0 with fields [temp]; entries 1000-0 (samefields),
    /// 1005-1 (own fields, deleted) and 1010-2 (own fields).
    fn sample_listpack() -> Vec<u8> {
        listpack(&[
            // master entry: count, deleted, num-fields, fields, 0
            "2", "1", "1", "temp", "0",
            // entry 1: flags=SAMEFIELDS, ms, seq, value, lp-count
            "2", "0", "0", "21", "4",
            // entry 2: flags=DELETED, ms, seq, num-fields, f, v, lp-count
            "1", "5", "1", "1", "temp", "22", "7",
            // entry 3: flags=0
            "0", "10", "2", "2", "temp", "23", "unit", "C", "9",
        ])
    }

    fn encode_stream(version: u8, with_entries: bool) -> Vec<u8> {
        let mut data = Vec::new();
        if with_entries {
            data.extend(encode_length(1));
            data.extend(encode_string(&raw_id(1000, 0)));
            data.extend(encode_string(&sample_listpack()));
        } else {
            data.extend(encode_length(0));
        }
        data.extend(encode_length(if with_entries { 2 } else { 0 })); // length
        data.extend(encode_length(1010)); // last id
        data.extend(encode_length(2));
        if version >= kind::STREAM_LISTPACKS_2 {
            data.extend(encode_length(1000)); // first id
            data.extend(encode_length(0));
            data.extend(encode_length(1005)); // max deleted
            data.extend(encode_length(1));
            data.extend(encode_length(3)); // entries added
        }

        data.extend(encode_length(1)); // groups
        data.extend(encode_string(b"workers"));
        data.extend(encode_length(1000));
        data.extend(encode_length(0));
        if version >= kind::STREAM_LISTPACKS_2 {
            data.extend(encode_length(1)); // entries read
        }
        data.extend(encode_length(1)); // global PEL
        data.extend(raw_id(1000, 0));
        data.extend_from_slice(&1_700_000_000_000u64.to_le_bytes());
        data.extend(encode_length(3));
        data.extend(encode_length(1)); // consumers
        data.extend(encode_string(b"alice"));
        data.extend_from_slice(&1_700_000_000_500u64.to_le_bytes());
        if version >= kind::STREAM_LISTPACKS_3 {
            data.extend_from_slice(&1_700_000_000_400u64.to_le_bytes());
        }
        data.extend(encode_length(1));
        data.extend(raw_id(1000, 0));
        data
    }

    fn load(version: u8, with_entries: bool) -> StreamObject {
        let data = encode_stream(version, with_entries);
        let len = data.len() as u64;
        let mut rd = RdbReader::new(Cursor::new(data));
        let obj = StreamObject::load(&mut rd, version, Bytes::from("events")).unwrap();
        assert_eq!(rd.position(), len);
        obj
    }

    fn strs(cmd: &Command) -> Vec<String> {
        cmd.iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_entries_skip_deleted_and_expand_samefields() {
        let s = load(kind::STREAM_LISTPACKS, true);
        assert_eq!(s.entries.len(), 2);
        assert_eq!(s.entries[0].id, StreamId::new(1000, 0));
        assert_eq!(
            s.entries[0].fields,
            vec![(Bytes::from("temp"), Bytes::from("21"))]
        );
        assert_eq!(s.entries[1].id, StreamId::new(1010, 2));
        assert_eq!(s.entries[1].fields.len(), 2);
        assert_eq!(s.last_id, StreamId::new(1010, 2));
        assert!(s.first_id.is_none());
    }

    #[test]
    fn test_rewrite_sequence() {
        let cmds = load(kind::STREAM_LISTPACKS, true).rewrite();
        let cmds: Vec<Vec<String>> = cmds.iter().map(strs).collect();
        assert_eq!(cmds[0], vec!["XADD", "events", "1000-0", "temp", "21"]);
        assert_eq!(
            cmds[1],
            vec!["XADD", "events", "1010-2", "temp", "23", "unit", "C"]
        );
        assert_eq!(cmds[2], vec!["XSETID", "events", "1010-2"]);
        assert_eq!(
            cmds[3],
            vec!["XGROUP", "CREATE", "events", "workers", "1000-0"]
        );
        assert_eq!(
            cmds[4],
            vec![
                "XCLAIM",
                "events",
                "workers",
                "alice",
                "0",
                "1000-0",
                "TIME",
                "1700000000000",
                "RETRYCOUNT",
                "3",
                "JUSTID",
                "FORCE"
            ]
        );
        assert_eq!(cmds.len(), 5);
    }

    #[test]
    fn test_v2_and_v3_metadata() {
        let s = load(kind::STREAM_LISTPACKS_2, true);
        assert_eq!(s.first_id, Some(StreamId::new(1000, 0)));
        assert_eq!(s.max_deleted_id, Some(StreamId::new(1005, 1)));
        assert_eq!(s.entries_added, Some(3));
        assert_eq!(s.groups[0].entries_read, Some(1));
        assert_eq!(s.groups[0].consumers[0].active_time, None);

        let s = load(kind::STREAM_LISTPACKS_3, true);
        assert_eq!(
            s.groups[0].consumers[0].active_time,
            Some(1_700_000_000_400)
        );
    }

    #[test]
    fn test_empty_stream_uses_maxlen_zero() {
        let cmds = load(kind::STREAM_LISTPACKS, false).rewrite();
        assert_eq!(
            strs(&cmds[0]),
            vec!["XADD", "events", "MAXLEN", "0", "1010-2", "x", "y"]
        );
        assert_eq!(strs(&cmds[1]), vec!["XSETID", "events", "1010-2"]);
    }

    fn empty_stream(groups: Vec<ConsumerGroup>) -> StreamObject {
        StreamObject {
            key: Bytes::from("events"),
            entries: Vec::new(),
            length: 0,
            last_id: StreamId::default(),
            first_id: None,
            max_deleted_id: None,
            entries_added: None,
            groups,
        }
    }

    #[test]
    fn test_never_written_stream_avoids_xadd_zero_id() {
        let cmds = empty_stream(Vec::new()).rewrite();
        assert_eq!(
            cmds.iter().map(|c| strs(c)).collect::<Vec<_>>(),
            vec![
                vec!["XGROUP", "CREATE", "events", "flashsync-empty", "0-0", "MKSTREAM"],
                vec!["XGROUP", "DESTROY", "events", "flashsync-empty"],
            ]
        );
        assert!(cmds.iter().all(|c| c[0] != Bytes::from("XADD")));
    }

    #[test]
    fn test_never_written_stream_with_group_uses_mkstream() {
        let group = ConsumerGroup {
            name: Bytes::from("workers"),
            last_id: StreamId::default(),
            entries_read: None,
            pending: Vec::new(),
            consumers: Vec::new(),
        };
        let cmds = empty_stream(vec![group]).rewrite();
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            strs(&cmds[0]),
            vec!["XGROUP", "CREATE", "events", "workers", "0-0", "MKSTREAM"]
        );
    }

    #[test]
    fn test_bad_master_terminator() {
        let lp = listpack::decode(&listpack(&["1", "0", "1", "f", "9"])).unwrap();
        let mut out = Vec::new();
        assert!(decode_listpack(StreamId::default(), lp, &mut out).is_err());
    }
}
