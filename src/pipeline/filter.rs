//! Allow/block lists applied to every entry.
//!
//! Order of checks:
//!
//! 1. keys: a key passes if it matches an allow prefix/suffix (or both allow
//!    lists are empty) and matches no block prefix/suffix. Every key must
//!    agree; an entry with some keys passing and some not is dropped.
//! 2. database index
//! 3. command name
//! 4. command group

use crate::entry::Entry;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterConfig {
    pub allow_key_prefix: Vec<String>,
    pub allow_key_suffix: Vec<String>,
    pub block_key_prefix: Vec<String>,
    pub block_key_suffix: Vec<String>,
    pub allow_db: Vec<u32>,
    pub block_db: Vec<u32>,
    pub allow_command: Vec<String>,
    pub block_command: Vec<String>,
    pub allow_command_group: Vec<String>,
    pub block_command_group: Vec<String>,
}

/// Result of running an entry through the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block,
    /// Some keys passed and some did not.
    Inconsistent {
        passed: Vec<String>,
        filtered: Vec<String>,
    },
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

impl FilterConfig {
    /// True when no list is configured.
    pub fn is_empty(&self) -> bool {
        *self == FilterConfig::default()
    }

    fn key_allowed(&self, key: &[u8]) -> bool {
        let allow = (self.allow_key_prefix.is_empty() && self.allow_key_suffix.is_empty())
            || self.allow_key_prefix.iter().any(|p| key.starts_with(p.as_bytes()))
            || self.allow_key_suffix.iter().any(|s| key.ends_with(s.as_bytes()));
        let block = self.block_key_prefix.iter().any(|p| key.starts_with(p.as_bytes()))
            || self.block_key_suffix.iter().any(|s| key.ends_with(s.as_bytes()));
        allow && !block
    }

    pub fn check(&self, e: &Entry) -> Verdict {
        let mut passed = Vec::new();
        let mut filtered = Vec::new();
        for key in &e.keys {
            let text = String::from_utf8_lossy(key).into_owned();
            if self.key_allowed(key) {
                passed.push(text);
            } else {
                filtered.push(text);
            }
        }
        match (passed.is_empty(), filtered.is_empty()) {
            (_, true) => {}
            (true, false) => return Verdict::Block,
            (false, false) => return Verdict::Inconsistent { passed, filtered },
        }

        if !self.allow_db.is_empty() && !self.allow_db.contains(&e.db) {
            return Verdict::Block;
        }
        if self.block_db.contains(&e.db) {
            return Verdict::Block;
        }

        if !self.allow_command.is_empty() && !contains(&self.allow_command, &e.cmd_name) {
            return Verdict::Block;
        }
        if contains(&self.block_command, &e.cmd_name) {
            return Verdict::Block;
        }

        if !self.allow_command_group.is_empty() && !contains(&self.allow_command_group, e.group) {
            return Verdict::Block;
        }
        if contains(&self.block_command_group, e.group) {
            return Verdict::Block;
        }

        Verdict::Allow
    }

    /// Applies [`check`](Self::check), logging inconsistent entries.
    pub fn allows(&self, e: &Entry) -> bool {
        match self.check(e) {
            Verdict::Allow => true,
            Verdict::Block => false,
            Verdict::Inconsistent { passed, filtered } => {
                warn!(
                    entry = %e,
                    passed = ?passed,
                    filtered = ?filtered,
                    "inconsistent filter result, dropping entry"
                );
                false
            }
        }
    }
}

fn contains(list: &[String], name: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(name))
}
