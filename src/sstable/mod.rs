//! Run files
//!
//! Immutable sorted files holding the commands of a store, ordered by
//! (key, TSN). Layout:
//!
//! ```text
//! [u32 length][command] ...        data section
//! [bincode RunFileMeta]            metadata
//! [u32 meta length][u32 meta CRC]  footer
//! [magic "SRUN"]
//! ```
//!
//! The metadata sits at the end so the writer can stream data without
//! knowing counts and ranges up front.

mod builder;
mod reader;

pub use builder::RunFileWriter;
pub use reader::{RunFileCursor, RunFileReader};

use crate::{FileIndex, Tsn};
use serde::{Deserialize, Serialize};

/// Run file format magic, last four bytes of every file.
pub const MAGIC: &[u8; 4] = b"SRUN";

pub const FILE_SUFFIX: &str = ".run";

pub fn file_name(index: FileIndex) -> String {
    format!("{:010}{}", index, FILE_SUFFIX)
}

/// Parse a run file name; returns `None` for unrelated files.
pub fn parse_file_index(file_name: &str) -> Option<FileIndex> {
    file_name.strip_suffix(FILE_SUFFIX)?.parse().ok()
}

/// Run file metadata, serialized into the file's tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFileMeta {
    pub file_index: FileIndex,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub min_tsn: Tsn,
    pub max_tsn: Tsn,
    pub entry_count: u64,
    /// Entries that are the newest version of their key within this file.
    pub head_entries: u64,
    /// Entries superseded by a newer version within this file.
    pub history_entries: u64,
    /// How many merges produced this file; flush output starts at 0.
    pub number_of_merges: u64,
    /// Every transaction with a TSN at or below this is fully contained
    /// in the run this file belongs to.
    pub max_completely_written_tsn: Tsn,
}

impl RunFileMeta {
    /// Whether the file may contain the given key.
    pub fn may_contain_key(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_roundtrip() {
        let name = file_name(37);
        assert_eq!(name, "0000000037.run");
        assert_eq!(parse_file_index(&name), Some(37));
        assert_eq!(parse_file_index("manifest"), None);
        assert_eq!(parse_file_index("x.run"), None);
    }

    #[test]
    fn test_key_range_check() {
        let meta = RunFileMeta {
            file_index: 0,
            min_key: b"b".to_vec(),
            max_key: b"m".to_vec(),
            min_tsn: 1,
            max_tsn: 2,
            entry_count: 2,
            head_entries: 2,
            history_entries: 0,
            number_of_merges: 0,
            max_completely_written_tsn: 2,
        };
        assert!(meta.may_contain_key(b"b"));
        assert!(meta.may_contain_key(b"f"));
        assert!(!meta.may_contain_key(b"a"));
        assert!(!meta.may_contain_key(b"z"));
    }
}
