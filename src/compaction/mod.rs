//! Compaction
//!
//! Background merging of run files. A compaction *process* (leveled or
//! tiered) inspects a store's file topology and decides whether to merge;
//! the *merge engine* combines the chosen files into sorted output while
//! dropping superseded versions.

pub mod leveled;
pub mod merge;
pub mod strategy;
pub mod tiered;

pub use leveled::LeveledCompactionProcess;
pub use merge::{MergeIterator, VersionRetention};
pub use strategy::{
    CompactionStrategy, FileSelectionStrategy, FileSeparationStrategy, LeveledCompactionStrategy,
    TieredCompactionStrategy,
};
pub use tiered::TieredCompactionProcess;

use crate::{FileIndex, LevelOrTier, Tsn};
use bytes::Bytes;

/// Everything a compaction process needs to know about one run file.
#[derive(Debug, Clone)]
pub struct CompactableFile {
    pub index: FileIndex,
    pub level_or_tier: LevelOrTier,
    pub size_bytes: u64,
    pub min_key: Bytes,
    pub max_key: Bytes,
    pub min_tsn: Tsn,
    pub max_tsn: Tsn,
    /// Entries that are the newest version of their key.
    pub head_entries: u64,
    /// Entries superseded by a newer version.
    pub history_entries: u64,
}

impl CompactableFile {
    /// Share of live entries in the file. Low values mean the file is
    /// mostly dead weight and a rewarding merge input.
    pub fn head_ratio(&self) -> f64 {
        let total = self.head_entries + self.history_entries;
        if total == 0 {
            return 1.0;
        }
        self.head_entries as f64 / total as f64
    }

    /// Whether the key ranges of two files intersect.
    pub fn overlaps_key_range(&self, other: &CompactableFile) -> bool {
        self.min_key <= other.max_key && self.max_key >= other.min_key
    }
}

/// Why a compaction was started. Decides which manifest operation records
/// the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTrigger {
    LeveledLevel0FileCount,
    LeveledSizeRatio,
    TieredSpaceAmplification,
    TieredSizeRatio,
    TieredHeightReduction,
}

/// A concrete unit of compaction work, produced by a process check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionTask {
    Leveled {
        trigger: CompactionTrigger,
        lower_level: LevelOrTier,
        upper_level: LevelOrTier,
        file_indices: Vec<FileIndex>,
        keep_tombstones: bool,
    },
    Tiered {
        trigger: CompactionTrigger,
        input_tiers: Vec<LevelOrTier>,
        file_indices: Vec<FileIndex>,
        keep_tombstones: bool,
    },
}

impl CompactionTask {
    pub fn file_indices(&self) -> &[FileIndex] {
        match self {
            CompactionTask::Leveled { file_indices, .. }
            | CompactionTask::Tiered { file_indices, .. } => file_indices,
        }
    }

    /// Level or tier the merged output lands in.
    pub fn output_level_or_tier(&self) -> LevelOrTier {
        match self {
            CompactionTask::Leveled { upper_level, .. } => *upper_level,
            CompactionTask::Tiered { input_tiers, .. } => {
                input_tiers.last().copied().unwrap_or(0)
            }
        }
    }

    pub fn keep_tombstones(&self) -> bool {
        match self {
            CompactionTask::Leveled {
                keep_tombstones, ..
            }
            | CompactionTask::Tiered {
                keep_tombstones, ..
            } => *keep_tombstones,
        }
    }

    pub fn trigger(&self) -> CompactionTrigger {
        match self {
            CompactionTask::Leveled { trigger, .. } | CompactionTask::Tiered { trigger, .. } => {
                *trigger
            }
        }
    }
}
