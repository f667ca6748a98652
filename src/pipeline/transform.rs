//! User transforms run after filtering.
//!
//! A transform sees the whole entry (db, group, name, keys, key positions,
//! slots, argv) and decides whether it passes unchanged, is dropped, or is
//! replaced by zero or more other commands in the same database.

use crate::entry::Entry;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Pass,
    Drop,
    Replace(Vec<Vec<Bytes>>),
}

pub trait Transform: Send + Sync {
    fn apply(&self, entry: &Entry) -> Outcome;
}

impl<F> Transform for F
where
    F: Fn(&Entry) -> Outcome + Send + Sync,
{
    fn apply(&self, entry: &Entry) -> Outcome {
        self(entry)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransformConfig {
    pub rename_key_prefix: Vec<PrefixRename>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PrefixRename {
    pub from: String,
    pub to: String,
}

/// Rewrites key prefixes, e.g. `tenant1:` to `tenant2:`.
///
/// The first matching rule wins for each key.
#[derive(Debug, Clone)]
pub struct KeyPrefixRename {
    rules: Vec<PrefixRename>,
}

impl KeyPrefixRename {
    pub fn new(rules: Vec<PrefixRename>) -> Self {
        Self { rules }
    }

    pub fn from_config(config: &TransformConfig) -> Option<Self> {
        if config.rename_key_prefix.is_empty() {
            None
        } else {
            Some(Self::new(config.rename_key_prefix.clone()))
        }
    }

    fn rename(&self, key: &[u8]) -> Option<Bytes> {
        let rule = self
            .rules
            .iter()
            .find(|r| key.starts_with(r.from.as_bytes()))?;
        let mut out = BytesMut::with_capacity(key.len() - rule.from.len() + rule.to.len());
        out.extend_from_slice(rule.to.as_bytes());
        out.extend_from_slice(&key[rule.from.len()..]);
        Some(out.freeze())
    }
}

impl Transform for KeyPrefixRename {
    fn apply(&self, entry: &Entry) -> Outcome {
        let mut argv = entry.argv.clone();
        let mut changed = false;
        for &i in &entry.key_indexes {
            if let Some(renamed) = self.rename(&argv[i]) {
                argv[i] = renamed;
                changed = true;
            }
        }
        if changed {
            Outcome::Replace(vec![argv])
        } else {
            Outcome::Pass
        }
    }
}
