//! Tiered compaction process
//!
//! Every flush pushes all existing tiers down by one and lands at tier 0,
//! so tier numbers equal age rank. Compaction always consumes whole,
//! consecutive tiers starting at tier 0 and writes the merge result into
//! the deepest input tier.

use super::{CompactableFile, CompactionTask, CompactionTrigger, TieredCompactionStrategy};
use crate::{FileIndex, LevelOrTier};
use tracing::debug;

pub struct TieredCompactionProcess;

impl TieredCompactionProcess {
    /// Decide whether the store needs a compaction right now.
    ///
    /// Triggers are checked in order: space amplification, size ratio,
    /// height reduction. All of them require at least two consecutive
    /// fully populated tiers starting at tier 0.
    pub fn check(
        strategy: &TieredCompactionStrategy,
        files: &[CompactableFile],
    ) -> Option<CompactionTask> {
        let tier_sizes = Self::tier_sizes(files);
        // length of the populated prefix: tiers 0..n without gaps
        let prefix_len = tier_sizes
            .iter()
            .position(|size| *size == 0)
            .unwrap_or(tier_sizes.len());
        if prefix_len < 2 {
            return None;
        }

        if let Some(task) = Self::check_space_amplification(strategy, files, &tier_sizes, prefix_len)
        {
            return Some(task);
        }
        if let Some(task) = Self::check_size_ratio(strategy, files, &tier_sizes, prefix_len) {
            return Some(task);
        }
        Self::check_height_reduction(strategy, files, prefix_len)
    }

    /// Total bytes per tier, indexed by tier number.
    fn tier_sizes(files: &[CompactableFile]) -> Vec<u64> {
        let max_tier = files.iter().map(|f| f.level_or_tier).max();
        let Some(max_tier) = max_tier else {
            return Vec::new();
        };
        let mut sizes = vec![0u64; max_tier as usize + 1];
        for file in files {
            sizes[file.level_or_tier as usize] += file.size_bytes;
        }
        sizes
    }

    /// Everything above the deepest tier is duplicated work the deepest
    /// tier will eventually absorb. Once that overhead reaches the
    /// configured factor, merge the whole populated prefix.
    fn check_space_amplification(
        strategy: &TieredCompactionStrategy,
        files: &[CompactableFile],
        tier_sizes: &[u64],
        prefix_len: usize,
    ) -> Option<CompactionTask> {
        // only meaningful when the prefix covers every populated tier
        if prefix_len != tier_sizes.len() {
            return None;
        }
        let last = tier_sizes[prefix_len - 1];
        if last == 0 {
            return None;
        }
        let above: u64 = tier_sizes[..prefix_len - 1].iter().sum();
        let amplification = above as f64 / last as f64;
        if amplification < strategy.space_amplification_trigger {
            return None;
        }
        let merge_tiers = prefix_len.min(strategy.max_merge_tiers);
        debug!(amplification, merge_tiers, "space amplification triggered compaction");
        Some(Self::build_task(
            CompactionTrigger::TieredSpaceAmplification,
            files,
            merge_tiers,
        ))
    }

    /// Walk the prefix from tier 0 and keep absorbing the next tier while
    /// the accumulated size stays within the ratio of it. Small young
    /// tiers get folded together before they are merged into a big one.
    fn check_size_ratio(
        strategy: &TieredCompactionStrategy,
        files: &[CompactableFile],
        tier_sizes: &[u64],
        prefix_len: usize,
    ) -> Option<CompactionTask> {
        let mut accumulated = tier_sizes[0];
        let mut include = 1usize;
        while include < prefix_len && include < strategy.max_merge_tiers {
            let next = tier_sizes[include];
            // stop once the next tier dwarfs what we have gathered
            if next as f64 > accumulated as f64 * strategy.size_ratio_trigger {
                break;
            }
            accumulated += next;
            include += 1;
        }
        if include < strategy.min_merge_tiers {
            return None;
        }
        debug!(tiers = include, "size ratio triggered compaction");
        Some(Self::build_task(
            CompactionTrigger::TieredSizeRatio,
            files,
            include,
        ))
    }

    /// Too many tiers hurt reads regardless of sizes; fold the youngest
    /// ones together to get back under the limit.
    fn check_height_reduction(
        strategy: &TieredCompactionStrategy,
        files: &[CompactableFile],
        prefix_len: usize,
    ) -> Option<CompactionTask> {
        let populated = files
            .iter()
            .map(|f| f.level_or_tier)
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        if populated <= strategy.num_tiers as usize {
            return None;
        }
        let merge_tiers = prefix_len
            .min(strategy.max_merge_tiers)
            .min(strategy.min_merge_tiers.max(2));
        debug!(populated, merge_tiers, "height reduction triggered compaction");
        Some(Self::build_task(
            CompactionTrigger::TieredHeightReduction,
            files,
            merge_tiers,
        ))
    }

    fn build_task(
        trigger: CompactionTrigger,
        files: &[CompactableFile],
        merge_tiers: usize,
    ) -> CompactionTask {
        let input_tiers: Vec<LevelOrTier> = (0..merge_tiers as LevelOrTier).collect();
        let deepest_input = merge_tiers as LevelOrTier - 1;
        let file_indices: Vec<FileIndex> = files
            .iter()
            .filter(|f| f.level_or_tier <= deepest_input)
            .map(|f| f.index)
            .collect();
        // output lands at deepest_input; tombstones may only go when
        // nothing is left below that
        let keep_tombstones = files
            .iter()
            .any(|f| f.level_or_tier > deepest_input);
        CompactionTask::Tiered {
            trigger,
            input_tiers,
            file_indices,
            keep_tombstones,
        }
    }
}
