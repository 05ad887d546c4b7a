//! LSM tree
//!
//! One tree per store: an active memtable taking writes, a queue of
//! immutable memtables waiting for flush, and the run files the manifest
//! lists. Flush and compaction run under a per-tree maintenance lock;
//! reads never take it.

pub mod garbage;
pub mod memtable;
pub mod tree;

pub use garbage::{FilePin, GarbageFileTracker};
pub use memtable::MemTable;
pub use tree::{LsmTree, LsmTreeReport};
