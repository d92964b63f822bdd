//! Append-only session log for loom.
//!
//! Entries live in an arena addressed by [`EntryIndex`]; each one names its
//! parent, so the log forms a tree whose active branch is selected by a leaf
//! cursor. Stores never delete entries. The only in-place mutation is
//! [`EntryStore::mark_pruned`], which redacts tool output.

pub mod fs;
pub mod memory;
pub mod store;
pub mod tree;
pub mod types;

pub use fs::FsEntryStore;
pub use memory::MemoryEntryStore;
pub use store::{EntryStore, EntryStoreError, EntryStoreResult, PruneMark};
pub use tree::{branch_path, common_ancestor, is_ancestor_or_self};
pub use types::{EntryIndex, EntryKind, SessionEntry, SessionHeader};
