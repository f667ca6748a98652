//! The unit of work flowing from a source to the writers.
//!
//! An [`Entry`] is one command to replay. Its name, group, keys and slots
//! are derived from `argv` and are recomputed by [`Entry::set_argv`]
//! whenever the arguments change.

use crate::commands::{calc_keys, key_slot};
use crate::protocol::{encode_command, encoded_len};
use bytes::Bytes;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Monotonic sequence id, assigned once by the pipeline.
    pub id: u64,
    pub db: u32,
    pub argv: Vec<Bytes>,
    pub cmd_name: String,
    pub group: &'static str,
    pub keys: Vec<Bytes>,
    pub key_indexes: Vec<usize>,
    pub slots: Vec<u16>,
    /// True for entries decoded from the snapshot.
    pub is_base: bool,
    /// Replication offset just past this command (live entries only).
    pub offset: Option<u64>,
    pub serialized_size: usize,
}

impl Entry {
    /// Builds an entry and derives its metadata. `argv` must not be empty.
    pub fn new(db: u32, argv: Vec<Bytes>) -> Self {
        debug_assert!(!argv.is_empty(), "entry argv must not be empty");
        let mut entry = Entry {
            id: 0,
            db,
            argv: Vec::new(),
            cmd_name: String::new(),
            group: "",
            keys: Vec::new(),
            key_indexes: Vec::new(),
            slots: Vec::new(),
            is_base: false,
            offset: None,
            serialized_size: 0,
        };
        entry.set_argv(argv);
        entry
    }

    /// An entry decoded from the RDB snapshot.
    pub fn snapshot(db: u32, argv: Vec<Bytes>) -> Self {
        let mut entry = Self::new(db, argv);
        entry.is_base = true;
        entry
    }

    /// An entry read from the live stream, ending at `offset`.
    pub fn live(db: u32, argv: Vec<Bytes>, offset: u64) -> Self {
        let mut entry = Self::new(db, argv);
        entry.offset = Some(offset);
        entry
    }

    /// Replaces the arguments and recomputes everything derived from them.
    pub fn set_argv(&mut self, argv: Vec<Bytes>) {
        let (name, group, key_indexes) = calc_keys(&argv);
        self.keys = key_indexes.iter().map(|&i| argv[i].clone()).collect();
        self.slots = self.keys.iter().map(|k| key_slot(k)).collect();
        self.serialized_size = encoded_len(&argv);
        self.cmd_name = name;
        self.group = group;
        self.key_indexes = key_indexes;
        self.argv = argv;
    }

    /// The RESP encoding sent to a target.
    pub fn serialize(&self) -> Vec<u8> {
        encode_command(&self.argv)
    }

    /// The single slot shared by all keys, `Ok(None)` if there are no keys,
    /// `Err(slots)` if they disagree.
    pub fn single_slot(&self) -> Result<Option<u16>, Vec<u16>> {
        let mut iter = self.slots.iter().copied();
        let Some(first) = iter.next() else {
            return Ok(None);
        };
        if iter.all(|s| s == first) {
            Ok(Some(first))
        } else {
            let mut distinct = self.slots.clone();
            distinct.sort_unstable();
            distinct.dedup();
            Err(distinct)
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db={} [", self.db)?;
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if arg.len() > 64 {
                write!(f, "<{} bytes>", arg.len())?;
            } else {
                write!(f, "{}", String::from_utf8_lossy(arg))?;
            }
        }
        write!(f, "]")
    }
}
