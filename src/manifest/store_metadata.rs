//! Per-store metadata held in the manifest

use crate::compaction::CompactionStrategy;
use crate::{FileIndex, LevelOrTier, StoreId, Tsn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Manifest record for a single run file: where it sits in the store's
/// level/tier topology. Sizes and key ranges live in the file itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LsmFileInfo {
    pub level_or_tier: LevelOrTier,
}

/// Everything the manifest knows about one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetadata {
    pub store_id: StoreId,
    pub compaction_strategy: CompactionStrategy,
    /// TSN of the transaction that created the store.
    pub created_at_tsn: Tsn,
    pub files: BTreeMap<FileIndex, LsmFileInfo>,
}

impl StoreMetadata {
    pub fn new(store_id: StoreId, compaction_strategy: CompactionStrategy, created_at_tsn: Tsn) -> Self {
        Self {
            store_id,
            compaction_strategy,
            created_at_tsn,
            files: BTreeMap::new(),
        }
    }

    pub fn has_file(&self, index: FileIndex) -> bool {
        self.files.contains_key(&index)
    }

    pub fn all_file_indices(&self) -> BTreeSet<FileIndex> {
        self.files.keys().copied().collect()
    }

    /// File indices sitting at the given level or tier, ascending.
    pub fn file_indices_at(&self, level_or_tier: LevelOrTier) -> Vec<FileIndex> {
        self.files
            .iter()
            .filter(|(_, info)| info.level_or_tier == level_or_tier)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Highest populated level or tier, or `None` for a file-less store.
    pub fn max_level_or_tier(&self) -> Option<LevelOrTier> {
        self.files.values().map(|info| info.level_or_tier).max()
    }

    /// Lowest file index not yet used by this store.
    pub fn next_free_file_index(&self) -> FileIndex {
        self.files.keys().next_back().map(|max| max + 1).unwrap_or(0)
    }

    pub(crate) fn add_file(&mut self, index: FileIndex, level_or_tier: LevelOrTier) {
        self.files.insert(index, LsmFileInfo { level_or_tier });
    }

    pub(crate) fn remove_file(&mut self, index: FileIndex) {
        self.files.remove(&index);
    }

    /// Move every tier up by one. Tiered flushes place the new run at
    /// tier 0, so all existing runs age by one tier.
    pub(crate) fn shift_tiers_up(&mut self) {
        for info in self.files.values_mut() {
            info.level_or_tier += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> StoreMetadata {
        StoreMetadata::new(
            StoreId::parse("m/test").unwrap(),
            CompactionStrategy::default(),
            1,
        )
    }

    #[test]
    fn test_topology_queries() {
        let mut meta = metadata();
        assert_eq!(meta.max_level_or_tier(), None);
        assert_eq!(meta.next_free_file_index(), 0);

        meta.add_file(0, 0);
        meta.add_file(1, 0);
        meta.add_file(5, 2);

        assert_eq!(meta.file_indices_at(0), vec![0, 1]);
        assert_eq!(meta.file_indices_at(2), vec![5]);
        assert_eq!(meta.max_level_or_tier(), Some(2));
        assert_eq!(meta.next_free_file_index(), 6);
        assert!(meta.has_file(5));
        assert!(!meta.has_file(3));
    }

    #[test]
    fn test_shift_tiers_up() {
        let mut meta = metadata();
        meta.add_file(0, 0);
        meta.add_file(1, 1);
        meta.shift_tiers_up();
        assert_eq!(meta.file_indices_at(1), vec![0]);
        assert_eq!(meta.file_indices_at(2), vec![1]);
    }
}
