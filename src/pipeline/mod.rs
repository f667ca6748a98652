//! Entry Pipeline
//!
//! Sits between the readers and the writers. Every entry already carries its
//! derived metadata (see [`Entry::set_argv`]); the pipeline decides what is
//! forwarded.
//!
//! ```text
//!   Entry ──> filter ──(blocked)──> counted as disallowed
//!               │
//!               ▼
//!           transform ──(Drop)────> counted as disallowed
//!               │
//!        Pass / Replace(..)
//!               │
//!               ▼
//!   0..n Entries, each with a fresh sequence id
//! ```

pub mod filter;
pub mod transform;

pub use filter::{FilterConfig, Verdict};
pub use transform::{KeyPrefixRename, Outcome, Transform, TransformConfig};

use crate::entry::Entry;
use crate::status::EntryCounter;
use std::sync::Arc;
use tracing::trace;

pub struct Pipeline {
    filter: FilterConfig,
    transform: Option<Box<dyn Transform>>,
    counter: Arc<EntryCounter>,
    next_id: u64,
}

impl Pipeline {
    pub fn new(filter: FilterConfig, counter: Arc<EntryCounter>) -> Self {
        Self {
            filter,
            transform: None,
            counter,
            next_id: 0,
        }
    }

    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Filters and transforms one entry.
    pub fn process(&mut self, entry: Entry) -> Vec<Entry> {
        if !self.filter.allows(&entry) {
            trace!(entry = %entry, "entry filtered");
            self.counter.record(&entry.cmd_name, false);
            return Vec::new();
        }

        let outcome = match &self.transform {
            Some(t) => t.apply(&entry),
            None => Outcome::Pass,
        };

        match outcome {
            Outcome::Pass => {
                self.counter.record(&entry.cmd_name, true);
                vec![self.stamp(entry)]
            }
            Outcome::Drop => {
                trace!(entry = %entry, "entry dropped by transform");
                self.counter.record(&entry.cmd_name, false);
                Vec::new()
            }
            Outcome::Replace(commands) => {
                self.counter.record(&entry.cmd_name, true);
                commands
                    .into_iter()
                    .filter(|argv| !argv.is_empty())
                    .map(|argv| {
                        let mut out = entry.clone();
                        out.set_argv(argv);
                        self.stamp(out)
                    })
                    .collect()
            }
        }
    }

    fn stamp(&mut self, mut entry: Entry) -> Entry {
        self.next_id += 1;
        entry.id = self.next_id;
        entry
    }
}
