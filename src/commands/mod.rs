//! Command Metadata
//!
//! Replayed commands are never executed here. This module only answers the
//! questions the pipeline and the writers ask about a command:
//!
//! - `table`: what is it called, which group does it belong to, and which
//!   arguments are keys
//! - `slot`: which cluster hash slot does each key belong to
//!
//! ```text
//! ["ZUNIONSTORE", "dst", "2", "a", "b"]
//!        │
//!        ▼  table::calc_keys
//! name=ZUNIONSTORE group=SORTED_SET keys at [1, 3, 4]
//!        │
//!        ▼  slot::key_slot
//! slots=[...]  (a writer for a cluster needs them all equal)
//! ```

pub mod slot;
pub mod table;

pub use slot::{key_slot, SLOT_COUNT};
pub use table::{calc_keys, command_name, CommandInfo, KeySpec};
