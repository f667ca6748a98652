//! Module values (RDB type 7).
//!
//! A module value starts with a 64-bit module id: the top 54 bits encode a
//! 9-character type name, the low 10 bits the encoding version. The body is a
//! sequence of typed fields, each prefixed by an opcode, ending with EOF.
//!
//! RedisBloom filters (`MBbloom--`) are decoded and rewritten through
//! `BF.LOADCHUNK`. Any other module is walked field by field to keep the
//! stream aligned, and produces no commands: module bytes are not a DUMP
//! payload and cannot go through RESTORE.

use super::{Command, RedisObject};
use crate::rdb::reader::RdbReader;
use crate::rdb::{kind, RdbError, RdbResult};
use bytes::Bytes;
use std::io::Read;
use tracing::warn;

const NAME_CHARSET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

const OPCODE_EOF: u64 = 0;
const OPCODE_SINT: u64 = 1;
const OPCODE_UINT: u64 = 2;
const OPCODE_FLOAT: u64 = 3;
const OPCODE_DOUBLE: u64 = 4;
const OPCODE_STRING: u64 = 5;

pub const BLOOM_TYPE_NAME: &str = "MBbloom--";

const BF_MIN_OPTIONS_ENC: u64 = 2;
const BF_MIN_GROWTH_ENC: u64 = 4;

/// RedisBloom 2.2.0 added growth to the header; later 2.2.x widened entries.
const BF_GROWTH_VERSION: u32 = 20200;
const BF_LEGACY_VERSION: u32 = 10000;

/// Largest `BF.LOADCHUNK` payload, as `BF.SCANDUMP` produces.
const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

/// Decodes the type name packed into a module id.
pub fn module_type_name(module_id: u64) -> String {
    let mut id = module_id >> 10;
    let mut name = [0u8; 9];
    for slot in name.iter_mut().rev() {
        *slot = NAME_CHARSET[(id & 63) as usize];
        id >>= 6;
    }
    String::from_utf8_lossy(&name).into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleObject {
    Bloom(BloomObject),
    /// A module we cannot re-encode; skipped with a warning.
    Unsupported { key: Bytes, type_name: String },
}

impl RedisObject for ModuleObject {
    fn load<R: Read>(rd: &mut RdbReader<R>, type_byte: u8, key: Bytes) -> RdbResult<Self> {
        if type_byte != kind::MODULE_2 {
            return Err(RdbError::UnsupportedModule(
                "RDB_TYPE_MODULE values carry no field annotations".into(),
            ));
        }
        let module_id = rd.read_length()?;
        let type_name = module_type_name(module_id);
        let encver = module_id & 1023;

        if type_name == BLOOM_TYPE_NAME {
            return Ok(ModuleObject::Bloom(BloomObject::load_body(rd, key, encver)?));
        }

        skip_fields(rd)?;
        warn!(
            key = %String::from_utf8_lossy(&key),
            module = %type_name,
            "skipping value of unsupported module type"
        );
        Ok(ModuleObject::Unsupported { key, type_name })
    }

    fn rewrite(&self) -> Vec<Command> {
        self.rewrite_for_target(0)
    }
}

impl ModuleObject {
    /// Rewrites for a target running RedisBloom `mbbloom_version`
    /// (e.g. 20206 for 2.2.6); 0 follows the source encoding.
    pub fn rewrite_for_target(&self, mbbloom_version: u32) -> Vec<Command> {
        match self {
            ModuleObject::Bloom(bloom) => bloom.rewrite(bloom.header_layout(mbbloom_version)),
            ModuleObject::Unsupported { .. } => Vec::new(),
        }
    }
}

/// Walks annotated module fields up to and including the EOF opcode.
pub fn skip_fields<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<()> {
    loop {
        match rd.read_length()? {
            OPCODE_EOF => return Ok(()),
            OPCODE_SINT | OPCODE_UINT => {
                rd.read_length()?;
            }
            OPCODE_FLOAT => {
                rd.read_f32()?;
            }
            OPCODE_DOUBLE => {
                rd.read_double()?;
            }
            OPCODE_STRING => {
                rd.read_string()?;
            }
            other => {
                return Err(RdbError::UnsupportedModule(format!(
                    "unknown module opcode {}",
                    other
                )))
            }
        }
    }
}

/// Skips a MODULE_AUX record: module id, `when` annotation, then fields.
pub fn skip_aux<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<String> {
    let module_id = rd.read_length()?;
    let when_opcode = rd.read_length()?;
    if when_opcode != OPCODE_UINT {
        return Err(RdbError::UnsupportedModule(format!(
            "module aux 'when' opcode {} is not UINT",
            when_opcode
        )));
    }
    let _when = rd.read_length()?;
    skip_fields(rd)?;
    Ok(module_type_name(module_id))
}

fn expect_opcode<R: Read>(rd: &mut RdbReader<R>, expected: u64) -> RdbResult<()> {
    let got = rd.read_length()?;
    if got != expected {
        return Err(RdbError::UnsupportedModule(format!(
            "expected module opcode {}, got {}",
            expected, got
        )));
    }
    Ok(())
}

fn read_unsigned<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<u64> {
    expect_opcode(rd, OPCODE_UINT)?;
    rd.read_length()
}

fn read_double<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<f64> {
    expect_opcode(rd, OPCODE_DOUBLE)?;
    rd.read_double()
}

fn read_string<R: Read>(rd: &mut RdbReader<R>) -> RdbResult<Bytes> {
    expect_opcode(rd, OPCODE_STRING)?;
    rd.read_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BloomLink {
    pub entries: u64,
    pub error: f64,
    pub hashes: u64,
    pub bits_per_entry: f64,
    pub bits: u64,
    pub n2: u64,
    pub filter: Bytes,
    pub size: u64,
}

/// Shape of the `BF.SCANDUMP` header a given RedisBloom accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub with_growth: bool,
    pub big_entries: bool,
}

impl HeaderLayout {
    pub const MODERN: Self = Self {
        with_growth: true,
        big_entries: true,
    };
    pub const GROWTH_ONLY: Self = Self {
        with_growth: true,
        big_entries: false,
    };
    pub const LEGACY: Self = Self {
        with_growth: false,
        big_entries: false,
    };
}

/// A scalable bloom filter: a chain of fixed-size filters.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomObject {
    pub key: Bytes,
    pub encver: u64,
    pub size: u64,
    pub options: u64,
    pub growth: u64,
    pub links: Vec<BloomLink>,
}

impl BloomObject {
    fn load_body<R: Read>(rd: &mut RdbReader<R>, key: Bytes, encver: u64) -> RdbResult<Self> {
        let size = read_unsigned(rd)?;
        let nfilters = read_unsigned(rd)?;
        let options = if encver >= BF_MIN_OPTIONS_ENC {
            read_unsigned(rd)?
        } else {
            0
        };
        let growth = if encver >= BF_MIN_GROWTH_ENC {
            read_unsigned(rd)?
        } else {
            2
        };

        let mut links = Vec::with_capacity((nfilters as usize).min(64));
        for _ in 0..nfilters {
            let entries = read_unsigned(rd)?;
            let error = read_double(rd)?;
            let hashes = read_unsigned(rd)?;
            let bits_per_entry = read_double(rd)?;
            let (bits, n2) = if encver == 0 {
                ((entries as f64 * bits_per_entry) as u64, 0)
            } else {
                (read_unsigned(rd)?, read_unsigned(rd)?)
            };
            let filter = read_string(rd)?;
            let link_size = read_unsigned(rd)?;
            links.push(BloomLink {
                entries,
                error,
                hashes,
                bits_per_entry,
                bits,
                n2,
                filter,
                size: link_size,
            });
        }
        expect_opcode(rd, OPCODE_EOF)?;

        Ok(Self {
            key,
            encver,
            size,
            options,
            growth,
            links,
        })
    }

    /// Picks the header layout from the target's RedisBloom version, or
    /// from the source encoding version when the target version is unknown.
    pub fn header_layout(&self, target_version: u32) -> HeaderLayout {
        match target_version {
            v if v > BF_GROWTH_VERSION => HeaderLayout::MODERN,
            BF_GROWTH_VERSION => HeaderLayout::GROWTH_ONLY,
            v if v >= BF_LEGACY_VERSION => HeaderLayout::LEGACY,
            _ if self.encver < BF_MIN_GROWTH_ENC => HeaderLayout::LEGACY,
            _ => HeaderLayout::MODERN,
        }
    }

    /// The dumped chain header `BF.SCANDUMP` returns as its first chunk.
    ///
    /// ```text
    /// header: size u64 | nfilters u32 | options u32 | [growth u32]
    /// link:   bytes u64 | bits u64 | size u64 | error f64 | bpe f64 |
    ///         hashes u32 | entries u64, n2 u8     (big entries)
    ///                    | entries u32, n2 u8     (otherwise)
    /// ```
    pub fn encoded_header(&self, layout: HeaderLayout) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&(self.links.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.options as u32).to_le_bytes());
        if layout.with_growth {
            out.extend_from_slice(&(self.growth as u32).to_le_bytes());
        }
        for link in &self.links {
            out.extend_from_slice(&(link.filter.len() as u64).to_le_bytes());
            out.extend_from_slice(&link.bits.to_le_bytes());
            out.extend_from_slice(&link.size.to_le_bytes());
            out.extend_from_slice(&link.error.to_le_bytes());
            out.extend_from_slice(&link.bits_per_entry.to_le_bytes());
            out.extend_from_slice(&(link.hashes as u32).to_le_bytes());
            if layout.big_entries {
                out.extend_from_slice(&link.entries.to_le_bytes());
            } else {
                out.extend_from_slice(&(link.entries as u32).to_le_bytes());
            }
            out.push(link.n2 as u8);
        }
        out
    }

    fn rewrite(&self, layout: HeaderLayout) -> Vec<Command> {
        let loadchunk = Bytes::from_static(b"BF.LOADCHUNK");
        let mut cmds = vec![vec![
            loadchunk.clone(),
            self.key.clone(),
            Bytes::from_static(b"1"),
            Bytes::from(self.encoded_header(layout)),
        ]];

        // Chunk iterators are 1-based positions just past each chunk within
        // the concatenated filter bytes, never spanning two links.
        let mut iter: u64 = 1;
        for link in &self.links {
            let mut offset = 0;
            while offset < link.filter.len() {
                let len = MAX_CHUNK_SIZE.min(link.filter.len() - offset);
                iter += len as u64;
                cmds.push(vec![
                    loadchunk.clone(),
                    self.key.clone(),
                    Bytes::from(iter.to_string()),
                    link.filter.slice(offset..offset + len),
                ]);
                offset += len;
            }
        }
        cmds
    }
}
