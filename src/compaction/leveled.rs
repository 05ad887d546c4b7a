//! Leveled compaction process
//!
//! Level 0 holds raw flush output with overlapping key ranges; every
//! level below holds one sorted run split across files. Target sizes are
//! derived from the real size of the deepest level, so shallow levels
//! stay empty until the store grows into them.

use super::{
    CompactableFile, CompactionTask, CompactionTrigger, LeveledCompactionStrategy,
};
use crate::{FileIndex, LevelOrTier};
use tracing::debug;

pub struct LeveledCompactionProcess;

impl LeveledCompactionProcess {
    /// Decide whether the store needs a compaction right now.
    ///
    /// Checked in order: level-0 file count, then the worst
    /// actual-to-target size ratio among populated levels. Ratios at or
    /// below 1.0 never trigger.
    pub fn check(
        strategy: &LeveledCompactionStrategy,
        files: &[CompactableFile],
    ) -> Option<CompactionTask> {
        if files.is_empty() {
            return None;
        }

        let level0: Vec<&CompactableFile> =
            files.iter().filter(|f| f.level_or_tier == 0).collect();
        let targets = Self::compute_target_level_sizes(strategy, files);
        let base_level = (1..=strategy.max_levels)
            .find(|level| targets[*level as usize] > 0)
            .unwrap_or(strategy.max_levels);

        if level0.len() >= strategy.level0_file_count_trigger {
            let mut inputs: Vec<FileIndex> = level0.iter().map(|f| f.index).collect();
            // level 0 files overlap each other, so they all have to go
            // together, plus whatever they touch in the base level
            let min_key = level0.iter().map(|f| &f.min_key).min()?.clone();
            let max_key = level0.iter().map(|f| &f.max_key).max()?.clone();
            for file in files {
                if file.level_or_tier == base_level
                    && file.min_key <= max_key
                    && file.max_key >= min_key
                {
                    inputs.push(file.index);
                }
            }
            debug!(
                files = level0.len(),
                base_level, "level 0 file count triggered compaction"
            );
            return Some(CompactionTask::Leveled {
                trigger: CompactionTrigger::LeveledLevel0FileCount,
                lower_level: 0,
                upper_level: base_level,
                file_indices: inputs,
                keep_tombstones: Self::keep_tombstones(files, base_level),
            });
        }

        let mut worst: Option<(LevelOrTier, f64)> = None;
        for level in 1..strategy.max_levels {
            let target = targets[level as usize];
            if target == 0 {
                continue;
            }
            let actual: u64 = files
                .iter()
                .filter(|f| f.level_or_tier == level)
                .map(|f| f.size_bytes)
                .sum();
            let ratio = actual as f64 / target as f64;
            if ratio > worst.map(|(_, r)| r).unwrap_or(1.0) {
                worst = Some((level, ratio));
            }
        }
        let (level, ratio) = worst?;
        debug!(level, ratio, "level size ratio triggered compaction");
        Some(Self::build_level_task(strategy, files, level))
    }

    /// Target byte size for each level, indexed by level number.
    ///
    /// The deepest level's target is its real size (at least the base
    /// minimum); each level above targets a multiplier-th of the level
    /// below it. Levels whose target would fall under the base minimum
    /// get a target of 0 and stay empty.
    pub fn compute_target_level_sizes(
        strategy: &LeveledCompactionStrategy,
        files: &[CompactableFile],
    ) -> Vec<u64> {
        let last = strategy.max_levels as usize;
        let mut targets = vec![0u64; last + 1];
        let last_level_size: u64 = files
            .iter()
            .filter(|f| f.level_or_tier == strategy.max_levels)
            .map(|f| f.size_bytes)
            .sum();
        targets[last] = last_level_size.max(strategy.base_level_min_size);
        for level in (1..last).rev() {
            let below = targets[level + 1] / strategy.level_size_multiplier;
            if below < strategy.base_level_min_size {
                break;
            }
            targets[level] = below;
        }
        targets
    }

    fn build_level_task(
        strategy: &LeveledCompactionStrategy,
        files: &[CompactableFile],
        level: LevelOrTier,
    ) -> CompactionTask {
        let mut candidates: Vec<CompactableFile> = files
            .iter()
            .filter(|f| f.level_or_tier == level)
            .cloned()
            .collect();
        strategy.file_selection.sort(&mut candidates);
        let picked = candidates[0].clone();

        let upper_level = level + 1;
        let mut inputs = vec![picked.index];
        for file in files {
            if file.level_or_tier == upper_level && file.overlaps_key_range(&picked) {
                inputs.push(file.index);
            }
        }
        CompactionTask::Leveled {
            trigger: CompactionTrigger::LeveledSizeRatio,
            lower_level: level,
            upper_level,
            file_indices: inputs,
            keep_tombstones: Self::keep_tombstones(files, upper_level),
        }
    }

    /// Tombstones may only be dropped when the merge output lands in the
    /// deepest populated level, where nothing can hide below it.
    fn keep_tombstones(files: &[CompactableFile], output_level: LevelOrTier) -> bool {
        files.iter().any(|f| f.level_or_tier > output_level)
    }
}
