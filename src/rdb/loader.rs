//! RDB Loader
//!
//! Drives the object decoders over a whole RDB stream and emits one
//! [`Entry`] per key, or several when a key is rewritten.
//!
//! ## Opcodes
//!
//! ```text
//! AUX k v          repl-stream-db is remembered, lua emits SCRIPT LOAD
//! SELECTDB n       following keys belong to db n
//! EXPIRETIME(_MS)  staged for the next key
//! IDLE / FREQ      staged for the next key
//! RESIZEDB         hints, ignored
//! FUNCTION2 code   emits FUNCTION LOAD
//! MODULE_AUX       walked and skipped
//! EOF              followed by the CRC-64 of everything before it
//! <type> key value a key
//! ```
//!
//! A key becomes `RESTORE key ttl <dump> [REPLACE] [IDLETIME n | FREQ n]`,
//! unless its encoded value is larger than the big-key threshold (or it is a
//! module value), in which case it is rewritten as incremental commands
//! followed by `PEXPIRE` when it has an expiry. Staged expiry, idle time and
//! frequency are cleared after every key.

use super::reader::RdbReader;
use super::types::{module, parse_object, RedisValue};
use super::{dump, opcode, RdbError, RdbResult, MAX_RDB_VERSION};
use crate::entry::Entry;
use bytes::Bytes;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// RDB version stamped into DUMP payloads. Targets reject payloads newer
/// than their own RDB version, and every type byte is accepted at 6.
const DUMP_RDB_VERSION: u16 = 6;

/// Which RESTORE modifiers the target understands and wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorePolicy {
    /// Append `REPLACE` (target >= 3.0).
    pub replace: bool,
    /// Forward `IDLETIME` / `FREQ` hints (target >= 5.0).
    pub lru_lfu_hints: bool,
}

impl RestorePolicy {
    /// Derives the policy from the target's `major.minor` version.
    pub fn for_target(version: (u32, u32), replace_existing: bool) -> Self {
        Self {
            replace: replace_existing && version >= (3, 0),
            lru_lfu_hints: version >= (5, 0),
        }
    }
}

impl Default for RestorePolicy {
    fn default() -> Self {
        Self {
            replace: false,
            lru_lfu_hints: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Name used in log lines.
    pub name: String,
    /// Values whose encoding exceeds this many bytes are rewritten.
    pub big_key_threshold: u64,
    pub restore: RestorePolicy,
    pub verify_checksum: bool,
    /// RedisBloom version on the target, e.g. 20206; 0 when unknown.
    pub target_mbbloom_version: u32,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            name: "rdb".to_string(),
            big_key_threshold: 500 * 1024 * 1024,
            restore: RestorePolicy::default(),
            verify_checksum: true,
            target_mbbloom_version: 0,
        }
    }
}

/// What a completed load reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderSummary {
    pub rdb_version: u32,
    /// Database the live stream starts in, from the `repl-stream-db` AUX field.
    pub repl_stream_db: Option<u32>,
    pub keys: u64,
    pub entries: u64,
    pub bytes: u64,
}

pub struct Loader {
    config: LoaderConfig,
    progress: Option<Box<dyn Fn(u64) + Send>>,

    db: u32,
    expire_at_ms: Option<u64>,
    idle: Option<u64>,
    freq: Option<u8>,
    summary: LoaderSummary,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            progress: None,
            db: 0,
            expire_at_ms: None,
            idle: None,
            freq: None,
            summary: LoaderSummary::default(),
        }
    }

    /// Calls `progress` with the number of bytes consumed so far.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(u64) + Send + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Decodes a whole RDB stream, handing every entry to `sink`.
    pub fn load<R, F>(mut self, source: R, mut sink: F) -> RdbResult<LoaderSummary>
    where
        R: Read,
        F: FnMut(Entry) -> RdbResult<()>,
    {
        let mut rd = RdbReader::new(source);
        let version = self.read_header(&mut rd)?;
        self.summary.rdb_version = version;
        debug!(name = %self.config.name, version, "RDB header");

        loop {
            let op = rd.read_u8()?;
            match op {
                opcode::IDLE => self.idle = Some(rd.read_length()?),
                opcode::FREQ => self.freq = Some(rd.read_u8()?),
                opcode::AUX => {
                    let key = rd.read_string()?;
                    let value = rd.read_string()?;
                    self.on_aux(&key, value, &mut sink)?;
                }
                opcode::RESIZEDB => {
                    let db_size = rd.read_length()?;
                    let expire_size = rd.read_length()?;
                    debug!(name = %self.config.name, db_size, expire_size, "RDB resize db");
                }
                opcode::SLOT_INFO => {
                    let slot = rd.read_length()?;
                    let _slot_size = rd.read_length()?;
                    let _expires_slot_size = rd.read_length()?;
                    debug!(name = %self.config.name, slot, "RDB slot info");
                }
                opcode::EXPIRETIME_MS => self.expire_at_ms = Some(rd.read_u64_le()?),
                opcode::EXPIRETIME => {
                    self.expire_at_ms = Some(rd.read_u32_le()? as u64 * 1000);
                }
                opcode::SELECTDB => {
                    let db = rd.read_length()?;
                    self.db = u32::try_from(db).map_err(|_| {
                        RdbError::container("SELECTDB", format!("db index {} out of range", db))
                    })?;
                }
                opcode::FUNCTION2 => {
                    let code = rd.read_string()?;
                    self.emit(
                        vec![Bytes::from_static(b"FUNCTION"), Bytes::from_static(b"LOAD"), code],
                        &mut sink,
                    )?;
                }
                opcode::FUNCTION => return Err(RdbError::UnsupportedOpcode(op)),
                opcode::MODULE_AUX => {
                    let module = module::skip_aux(&mut rd)?;
                    debug!(name = %self.config.name, module = %module, "skipped module aux data");
                }
                opcode::EOF => break,
                type_byte => self.load_key(&mut rd, type_byte, &mut sink)?,
            }
            self.report(&rd);
        }

        self.verify_trailer(&mut rd, version)?;
        self.report(&rd);
        self.summary.bytes = rd.position();
        info!(
            name = %self.config.name,
            keys = self.summary.keys,
            entries = self.summary.entries,
            bytes = self.summary.bytes,
            "RDB load finished"
        );
        Ok(self.summary)
    }

    fn read_header<R: Read>(&self, rd: &mut RdbReader<R>) -> RdbResult<u32> {
        let header = rd.read_array::<9>()?;
        if &header[..5] != b"REDIS" {
            return Err(RdbError::InvalidMagic(header[..5].to_vec()));
        }
        let digits = String::from_utf8_lossy(&header[5..]).into_owned();
        let version: u32 = digits
            .parse()
            .map_err(|_| RdbError::InvalidVersion(digits.clone()))?;
        if version == 0 || version > MAX_RDB_VERSION {
            return Err(RdbError::UnsupportedVersion(version));
        }
        Ok(version)
    }

    fn verify_trailer<R: Read>(&self, rd: &mut RdbReader<R>, version: u32) -> RdbResult<()> {
        // Checksums were added in RDB version 5.
        if version < 5 {
            return Ok(());
        }
        let actual = rd.take_checksum();
        let expected = rd.read_u64_le()?;
        if expected == 0 || !self.config.verify_checksum {
            return Ok(());
        }
        if expected != actual {
            return Err(RdbError::ChecksumMismatch { expected, actual });
        }
        Ok(())
    }

    fn on_aux<F>(&mut self, key: &[u8], value: Bytes, sink: &mut F) -> RdbResult<()>
    where
        F: FnMut(Entry) -> RdbResult<()>,
    {
        match key {
            b"repl-stream-db" => {
                let text = String::from_utf8_lossy(&value).into_owned();
                let db = text.parse().map_err(|_| RdbError::InvalidAux {
                    key: "repl-stream-db".to_string(),
                    value: text.clone(),
                })?;
                debug!(name = %self.config.name, db, "RDB repl-stream-db");
                self.summary.repl_stream_db = Some(db);
            }
            b"lua" => {
                debug!(name = %self.config.name, "RDB lua script");
                self.emit(
                    vec![Bytes::from_static(b"SCRIPT"), Bytes::from_static(b"LOAD"), value],
                    sink,
                )?;
            }
            _ => {
                debug!(
                    name = %self.config.name,
                    key = %String::from_utf8_lossy(key),
                    value = %String::from_utf8_lossy(&value),
                    "RDB AUX"
                );
            }
        }
        Ok(())
    }

    fn load_key<R, F>(&mut self, rd: &mut RdbReader<R>, type_byte: u8, sink: &mut F) -> RdbResult<()>
    where
        R: Read,
        F: FnMut(Entry) -> RdbResult<()>,
    {
        let key = rd.read_string()?;

        let limit = usize::try_from(self.config.big_key_threshold).unwrap_or(usize::MAX);
        rd.start_recording(limit);
        let value = parse_object(rd, type_byte, key.clone());
        let raw = rd.finish_recording();
        let value = value?;
        self.summary.keys += 1;

        let ttl = self.take_ttl_ms();
        let idle = self.idle.take();
        let freq = self.freq.take();

        match (&value, raw) {
            (RedisValue::Module(_), _) | (_, None) => {
                let commands = match &value {
                    RedisValue::Module(module) => {
                        module.rewrite_for_target(self.config.target_mbbloom_version)
                    }
                    other => other.rewrite(),
                };
                if commands.is_empty() {
                    return Ok(());
                }
                if !matches!(value, RedisValue::Module(_)) {
                    debug!(
                        name = %self.config.name,
                        key = %String::from_utf8_lossy(&key),
                        kind = value.type_name(),
                        commands = commands.len(),
                        "rewriting big key"
                    );
                }
                for cmd in commands {
                    self.emit(cmd, sink)?;
                }
                if let Some(ttl) = ttl {
                    self.emit(
                        vec![
                            Bytes::from_static(b"PEXPIRE"),
                            key,
                            Bytes::from(ttl.to_string()),
                        ],
                        sink,
                    )?;
                }
            }
            (_, Some(raw)) => {
                let mut argv = vec![
                    Bytes::from_static(b"RESTORE"),
                    key,
                    Bytes::from(ttl.unwrap_or(0).to_string()),
                    dump::payload(type_byte, &raw, DUMP_RDB_VERSION),
                ];
                let policy = self.config.restore;
                if policy.replace {
                    argv.push(Bytes::from_static(b"REPLACE"));
                }
                if policy.lru_lfu_hints {
                    // RESTORE rejects IDLETIME together with FREQ.
                    if let Some(idle) = idle {
                        argv.push(Bytes::from_static(b"IDLETIME"));
                        argv.push(Bytes::from(idle.to_string()));
                    } else if let Some(freq) = freq {
                        argv.push(Bytes::from_static(b"FREQ"));
                        argv.push(Bytes::from(freq.to_string()));
                    }
                }
                self.emit(argv, sink)?;
            }
        }
        Ok(())
    }

    /// Relative TTL of the staged expiry; already-expired keys get 1 ms.
    fn take_ttl_ms(&mut self) -> Option<u64> {
        let at = self.expire_at_ms.take()?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Some(at.saturating_sub(now).max(1))
    }

    fn emit<F>(&mut self, argv: Vec<Bytes>, sink: &mut F) -> RdbResult<()>
    where
        F: FnMut(Entry) -> RdbResult<()>,
    {
        self.summary.entries += 1;
        sink(Entry::snapshot(self.db, argv))
    }

    fn report<R: Read>(&self, rd: &RdbReader<R>) {
        if let Some(progress) = &self.progress {
            progress(rd.position());
        }
    }
}

/// Convenience wrapper collecting every entry of an in-memory RDB.
pub fn load_all(config: LoaderConfig, data: &[u8]) -> RdbResult<(Vec<Entry>, LoaderSummary)> {
    let mut entries = Vec::new();
    let summary = Loader::new(config).load(data, |e| {
        entries.push(e);
        Ok(())
    })?;
    Ok((entries, summary))
}
