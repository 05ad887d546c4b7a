//! Compaction strategy configuration
//!
//! Every store carries its strategy in the manifest, so the choice is
//! durable and per store. Leveled stores keep one sorted run per level
//! (except level 0); tiered stores stack whole runs into tiers.

use crate::config;
use serde::{Deserialize, Serialize};

/// Per-store compaction strategy, persisted in the store metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompactionStrategy {
    #[serde(rename = "leveled")]
    Leveled(LeveledCompactionStrategy),
    #[serde(rename = "tiered")]
    Tiered(TieredCompactionStrategy),
}

impl CompactionStrategy {
    pub fn is_leveled(&self) -> bool {
        matches!(self, CompactionStrategy::Leveled(_))
    }

    pub fn is_tiered(&self) -> bool {
        matches!(self, CompactionStrategy::Tiered(_))
    }

    pub fn file_separation(&self) -> &FileSeparationStrategy {
        match self {
            CompactionStrategy::Leveled(s) => &s.file_separation,
            CompactionStrategy::Tiered(s) => &s.file_separation,
        }
    }
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy::Leveled(LeveledCompactionStrategy::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeveledCompactionStrategy {
    /// Highest usable level (level 0 not counted).
    pub max_levels: u32,
    /// Target size factor between adjacent levels.
    pub level_size_multiplier: u64,
    /// Smallest target size of the base level; levels whose computed
    /// target would fall below this are kept empty.
    pub base_level_min_size: u64,
    /// Number of level-0 files that forces a compaction into the base level.
    pub level0_file_count_trigger: usize,
    pub file_selection: FileSelectionStrategy,
    pub file_separation: FileSeparationStrategy,
}

impl Default for LeveledCompactionStrategy {
    fn default() -> Self {
        Self {
            max_levels: 6,
            level_size_multiplier: config::LEVEL_SIZE_MULTIPLIER,
            base_level_min_size: config::BASE_LEVEL_MIN_SIZE,
            level0_file_count_trigger: config::L0_COMPACTION_TRIGGER,
            file_selection: FileSelectionStrategy::default(),
            file_separation: FileSeparationStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredCompactionStrategy {
    /// Tiers tolerated before height reduction kicks in.
    pub num_tiers: u32,
    /// Merge everything once size(all but last tier) / size(last tier)
    /// reaches this factor.
    pub space_amplification_trigger: f64,
    /// Merge a prefix of tiers while the accumulated size stays within
    /// this factor of the next tier.
    pub size_ratio_trigger: f64,
    /// Minimum number of tiers merged at once.
    pub min_merge_tiers: usize,
    /// Maximum number of tiers merged at once.
    pub max_merge_tiers: usize,
    pub file_separation: FileSeparationStrategy,
}

impl Default for TieredCompactionStrategy {
    fn default() -> Self {
        Self {
            num_tiers: 6,
            space_amplification_trigger: 2.0,
            size_ratio_trigger: 1.35,
            min_merge_tiers: 4,
            max_merge_tiers: 32,
            file_separation: FileSeparationStrategy::default(),
        }
    }
}

/// Order in which files of the triggering level are picked for merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileSelectionStrategy {
    /// Files with the most superseded entries first. Ties break by
    /// smallest TSN, then file index.
    #[default]
    ByMostDeletions,
    /// Files with the oldest minimum TSN first.
    OldestSmallestSequenceFirst,
    /// Files with the oldest maximum TSN first.
    OldestLargestSequenceFirst,
}

impl FileSelectionStrategy {
    /// Sort candidate files into pick order for this strategy.
    pub fn sort(&self, files: &mut [super::CompactableFile]) {
        match self {
            FileSelectionStrategy::ByMostDeletions => {
                files.sort_by(|a, b| {
                    a.head_ratio()
                        .partial_cmp(&b.head_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.min_tsn.cmp(&b.min_tsn))
                        .then(a.index.cmp(&b.index))
                });
            }
            FileSelectionStrategy::OldestSmallestSequenceFirst => {
                files.sort_by(|a, b| a.min_tsn.cmp(&b.min_tsn).then(a.index.cmp(&b.index)));
            }
            FileSelectionStrategy::OldestLargestSequenceFirst => {
                files.sort_by(|a, b| a.max_tsn.cmp(&b.max_tsn).then(a.index.cmp(&b.index)));
            }
        }
    }
}

/// How merge output is cut into files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FileSeparationStrategy {
    /// All merge output goes into one file.
    SingleFile,
    /// Start a new output file once the current one exceeds the limit.
    SizeBased { max_file_size: u64 },
}

impl Default for FileSeparationStrategy {
    fn default() -> Self {
        FileSeparationStrategy::SizeBased {
            max_file_size: config::FILE_SEPARATION_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactableFile;
    use bytes::Bytes;

    fn file(index: u64, min_tsn: u64, max_tsn: u64, head: u64, history: u64) -> CompactableFile {
        CompactableFile {
            index,
            level_or_tier: 0,
            size_bytes: 100,
            min_key: Bytes::from_static(b"a"),
            max_key: Bytes::from_static(b"z"),
            min_tsn,
            max_tsn,
            head_entries: head,
            history_entries: history,
        }
    }

    #[test]
    fn test_strategy_json_roundtrip() {
        let strategies = [
            CompactionStrategy::default(),
            CompactionStrategy::Tiered(TieredCompactionStrategy::default()),
        ];
        for strategy in strategies {
            let json = serde_json::to_string(&strategy).unwrap();
            let back: CompactionStrategy = serde_json::from_str(&json).unwrap();
            assert_eq!(back, strategy);
        }
    }

    #[test]
    fn test_by_most_deletions_prefers_history_heavy_files() {
        // file 2 is mostly superseded versions, it should sort first
        let mut files = vec![file(1, 5, 10, 90, 10), file(2, 6, 12, 10, 90)];
        FileSelectionStrategy::ByMostDeletions.sort(&mut files);
        assert_eq!(files[0].index, 2);
    }

    #[test]
    fn test_sequence_based_orderings() {
        let mut files = vec![file(1, 8, 20, 50, 0), file(2, 3, 30, 50, 0)];
        FileSelectionStrategy::OldestSmallestSequenceFirst.sort(&mut files);
        assert_eq!(files[0].index, 2);

        let mut files = vec![file(1, 8, 20, 50, 0), file(2, 3, 30, 50, 0)];
        FileSelectionStrategy::OldestLargestSequenceFirst.sort(&mut files);
        assert_eq!(files[0].index, 1);
    }
}
