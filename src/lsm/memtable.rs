//! In-memory write buffer backed by a lock-free skip list.
//!
//! Each entry is keyed by (key, tsn), so a memtable holds every version
//! it has seen and point lookups pick the newest version at or below
//! the requested TSN.

use crate::{Command, KeyAndTsn, Tsn};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Sorted in-memory buffer of recent writes for one store.
pub struct MemTable {
    /// `None` marks a deletion.
    data: SkipMap<KeyAndTsn, Option<Bytes>>,
    /// Approximate size in bytes.
    size_bytes: AtomicUsize,
    /// Smallest TSN held, `u64::MAX` while empty.
    min_tsn: AtomicU64,
    /// Largest TSN held, 0 while empty.
    max_tsn: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            min_tsn: AtomicU64::new(u64::MAX),
            max_tsn: AtomicU64::new(0),
        }
    }

    /// Apply a single command. Returns the bytes this entry added.
    pub fn apply(&self, command: Command) -> usize {
        let entry_size = command.byte_size();
        let tsn = command.tsn();
        let (key_and_tsn, value) = match command {
            Command::Put { key, tsn, value } => (KeyAndTsn { key, tsn }, Some(value)),
            Command::Del { key, tsn } => (KeyAndTsn { key, tsn }, None),
        };
        self.data.insert(key_and_tsn, value);
        self.size_bytes.fetch_add(entry_size, Ordering::Relaxed);
        self.min_tsn.fetch_min(tsn, Ordering::Relaxed);
        self.max_tsn.fetch_max(tsn, Ordering::Relaxed);
        entry_size
    }

    /// Newest version of `key` at or below `max_tsn`, tombstones included.
    pub fn get(&self, key: &[u8], max_tsn: Tsn) -> Option<Command> {
        let lower = KeyAndTsn {
            key: Bytes::copy_from_slice(key),
            tsn: 0,
        };
        let upper = KeyAndTsn {
            key: lower.key.clone(),
            tsn: max_tsn,
        };
        self.data
            .range(lower..=upper)
            .next_back()
            .map(|entry| match entry.value() {
                Some(value) => Command::Put {
                    key: entry.key().key.clone(),
                    tsn: entry.key().tsn,
                    value: value.clone(),
                },
                None => Command::Del {
                    key: entry.key().key.clone(),
                    tsn: entry.key().tsn,
                },
            })
    }

    /// All entries in (key, tsn) order, ready to hand to a run file writer.
    pub fn commands(&self) -> Vec<Command> {
        self.data
            .iter()
            .map(|entry| match entry.value() {
                Some(value) => Command::Put {
                    key: entry.key().key.clone(),
                    tsn: entry.key().tsn,
                    value: value.clone(),
                },
                None => Command::Del {
                    key: entry.key().key.clone(),
                    tsn: entry.key().tsn,
                },
            })
            .collect()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Smallest TSN held, if any entry exists.
    pub fn min_tsn(&self) -> Option<Tsn> {
        match self.min_tsn.load(Ordering::Relaxed) {
            u64::MAX => None,
            tsn => Some(tsn),
        }
    }

    /// Largest TSN held, if any entry exists.
    pub fn max_tsn(&self) -> Option<Tsn> {
        if self.is_empty() {
            None
        } else {
            Some(self.max_tsn.load(Ordering::Relaxed))
        }
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_picks_newest_visible_version() {
        let memtable = MemTable::new();
        memtable.apply(Command::put(&b"k"[..], 1, &b"v1"[..]));
        memtable.apply(Command::put(&b"k"[..], 5, &b"v5"[..]));
        memtable.apply(Command::put(&b"k"[..], 9, &b"v9"[..]));

        assert_eq!(memtable.get(b"k", 9), Some(Command::put(&b"k"[..], 9, &b"v9"[..])));
        assert_eq!(memtable.get(b"k", 7), Some(Command::put(&b"k"[..], 5, &b"v5"[..])));
        assert_eq!(memtable.get(b"k", 4), Some(Command::put(&b"k"[..], 1, &b"v1"[..])));
        assert_eq!(memtable.get(b"k", 0), None);
        assert_eq!(memtable.get(b"other", 9), None);
    }

    #[test]
    fn test_tombstone_is_returned_not_hidden() {
        let memtable = MemTable::new();
        memtable.apply(Command::put(&b"k"[..], 1, &b"v"[..]));
        memtable.apply(Command::del(&b"k"[..], 2));

        let latest = memtable.get(b"k", 10).unwrap();
        assert!(latest.is_tombstone());
        assert_eq!(latest.tsn(), 2);
    }

    #[test]
    fn test_commands_come_out_sorted() {
        let memtable = MemTable::new();
        memtable.apply(Command::put(&b"b"[..], 2, &b"x"[..]));
        memtable.apply(Command::put(&b"a"[..], 3, &b"y"[..]));
        memtable.apply(Command::put(&b"a"[..], 1, &b"z"[..]));

        let commands = memtable.commands();
        assert_eq!(
            commands,
            vec![
                Command::put(&b"a"[..], 1, &b"z"[..]),
                Command::put(&b"a"[..], 3, &b"y"[..]),
                Command::put(&b"b"[..], 2, &b"x"[..]),
            ]
        );
    }

    #[test]
    fn test_tsn_bounds_track_inserts() {
        let memtable = MemTable::new();
        assert_eq!(memtable.min_tsn(), None);
        assert_eq!(memtable.max_tsn(), None);

        memtable.apply(Command::put(&b"a"[..], 7, &b"v"[..]));
        memtable.apply(Command::del(&b"b"[..], 3));
        assert_eq!(memtable.min_tsn(), Some(3));
        assert_eq!(memtable.max_tsn(), Some(7));
        assert!(memtable.size_bytes() > 0);
    }
}
