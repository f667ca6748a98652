//! Persisted resume point of a replication session.
//!
//! The file holds one line, `<replid> <offset> <db>`: the replication id, the
//! offset just past the last live command handed to dispatch, and the
//! database that command ran in. It is rewritten through a temporary file
//! and a rename so a crash never leaves half a line behind.

use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

pub const FILE_NAME: &str = "checkpoint";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub replid: String,
    pub offset: u64,
    pub db: u32,
}

impl Checkpoint {
    pub fn new(replid: impl Into<String>, offset: u64, db: u32) -> Self {
        Self {
            replid: replid.into(),
            offset,
            db,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let replid = parts.next()?;
        let offset = parts.next()?.parse().ok()?;
        let db = parts.next().map(str::parse).unwrap_or(Ok(0)).ok()?;
        if parts.next().is_some() || replid.len() != 40 {
            return None;
        }
        Some(Self::new(replid, offset, db))
    }

    /// Arguments for `PSYNC`: the next byte wanted is `offset + 1`.
    pub fn psync_args(&self) -> (String, String) {
        (self.replid.clone(), (self.offset + 1).to_string())
    }

    /// Reads the checkpoint, treating a missing or malformed file as absent.
    pub async fn load(dir: &Path) -> std::io::Result<Option<Self>> {
        let path = dir.join(FILE_NAME);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let checkpoint = Self::parse(&text);
        if checkpoint.is_none() {
            warn!(path = %path.display(), content = %text.trim(), "ignoring malformed checkpoint");
        }
        Ok(checkpoint)
    }

    pub async fn store(&self, dir: &Path) -> std::io::Result<()> {
        let tmp = dir.join(format!("{}.tmp", FILE_NAME));
        fs::write(&tmp, format!("{} {} {}\n", self.replid, self.offset, self.db)).await?;
        fs::rename(&tmp, dir.join(FILE_NAME)).await?;
        debug!(replid = %self.replid, offset = self.offset, db = self.db, "checkpoint stored");
        Ok(())
    }

    pub async fn remove(dir: &Path) -> std::io::Result<()> {
        match fs::remove_file(dir.join(FILE_NAME)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
