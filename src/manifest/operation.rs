//! Manifest operations
//!
//! The manifest is event-sourced: the on-disk file is an append-only log
//! of these operations, and the in-memory `Manifest` is the fold over
//! them. Every operation carries its own sequence number and validates
//! its preconditions against the state it is applied to, so a corrupted
//! or hand-edited manifest is rejected deterministically at replay.

use super::store_metadata::StoreMetadata;
use super::Manifest;
use crate::{FileIndex, LevelOrTier, Result, StoreId, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ManifestOperation {
    /// Full snapshot of all store metadata. Only valid as the first
    /// operation of a manifest file; written by checkpoint rewrites.
    Checkpoint {
        sequence_number: u64,
        stores: BTreeMap<StoreId, StoreMetadata>,
    },
    /// A new, empty store came into existence.
    CreateStore {
        sequence_number: u64,
        metadata: StoreMetadata,
    },
    /// A memtable was written out as a new run file. Leveled stores get
    /// the file at level 0; tiered stores shift all tiers up by one and
    /// put the file at tier 0.
    Flush {
        sequence_number: u64,
        store_id: StoreId,
        file_index: FileIndex,
    },
    /// All input files merged into the given output level or tier.
    FullCompaction {
        sequence_number: u64,
        store_id: StoreId,
        input_file_indices: BTreeSet<FileIndex>,
        output_file_indices: BTreeSet<FileIndex>,
        output_level_or_tier: LevelOrTier,
    },
    /// Files of two adjacent levels merged into the upper level.
    LeveledCompaction {
        sequence_number: u64,
        store_id: StoreId,
        lower_level: LevelOrTier,
        upper_level: LevelOrTier,
        input_file_indices: BTreeSet<FileIndex>,
        output_file_indices: BTreeSet<FileIndex>,
    },
    /// A run of consecutive tiers merged into the tier below them.
    TieredCompaction {
        sequence_number: u64,
        store_id: StoreId,
        input_tiers: Vec<LevelOrTier>,
        input_file_indices: BTreeSet<FileIndex>,
        output_file_indices: BTreeSet<FileIndex>,
    },
    /// The store and all its files left the manifest.
    DeleteStore {
        sequence_number: u64,
        store_id: StoreId,
    },
}

impl ManifestOperation {
    pub fn sequence_number(&self) -> u64 {
        match self {
            ManifestOperation::Checkpoint { sequence_number, .. }
            | ManifestOperation::CreateStore { sequence_number, .. }
            | ManifestOperation::Flush { sequence_number, .. }
            | ManifestOperation::FullCompaction { sequence_number, .. }
            | ManifestOperation::LeveledCompaction { sequence_number, .. }
            | ManifestOperation::TieredCompaction { sequence_number, .. }
            | ManifestOperation::DeleteStore { sequence_number, .. } => *sequence_number,
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, ManifestOperation::Checkpoint { .. })
    }

    /// Validate and apply this operation to the manifest.
    ///
    /// Sequencing (strictly `last + 1`, checkpoints only at the start of
    /// a file) is enforced by the caller; this method checks the
    /// operation's own preconditions.
    pub fn apply_to(&self, manifest: &mut Manifest) -> Result<()> {
        match self {
            ManifestOperation::Checkpoint { stores, .. } => {
                for (store_id, metadata) in stores {
                    if metadata.store_id != *store_id {
                        return self.reject(format!(
                            "checkpoint maps key '{}' to metadata of store '{}'",
                            store_id, metadata.store_id
                        ));
                    }
                }
                manifest.stores = stores.clone();
            }
            ManifestOperation::CreateStore { metadata, .. } => {
                if manifest.stores.contains_key(&metadata.store_id) {
                    return self.reject(format!("store '{}' already exists", metadata.store_id));
                }
                if !metadata.files.is_empty() {
                    return self.reject(format!(
                        "new store '{}' must not carry files",
                        metadata.store_id
                    ));
                }
                manifest
                    .stores
                    .insert(metadata.store_id.clone(), metadata.clone());
            }
            ManifestOperation::Flush {
                store_id,
                file_index,
                ..
            } => {
                let metadata = self.store_mut(manifest, store_id)?;
                if metadata.has_file(*file_index) {
                    return self.reject(format!(
                        "flush output file {} already exists in store '{}'",
                        file_index, store_id
                    ));
                }
                if metadata.compaction_strategy.is_tiered() {
                    metadata.shift_tiers_up();
                }
                metadata.add_file(*file_index, 0);
            }
            ManifestOperation::FullCompaction {
                store_id,
                input_file_indices,
                output_file_indices,
                output_level_or_tier,
                ..
            } => {
                let metadata = self.store_mut(manifest, store_id)?;
                self.check_inputs_outputs(metadata, input_file_indices, output_file_indices)?;
                for index in input_file_indices {
                    metadata.remove_file(*index);
                }
                for index in output_file_indices {
                    metadata.add_file(*index, *output_level_or_tier);
                }
            }
            ManifestOperation::LeveledCompaction {
                store_id,
                lower_level,
                upper_level,
                input_file_indices,
                output_file_indices,
                ..
            } => {
                let metadata = self.store_mut(manifest, store_id)?;
                if !metadata.compaction_strategy.is_leveled() {
                    return self.reject(format!("store '{}' is not leveled", store_id));
                }
                if lower_level >= upper_level {
                    return self.reject(format!(
                        "lower level {} must be below upper level {}",
                        lower_level, upper_level
                    ));
                }
                self.check_inputs_outputs(metadata, input_file_indices, output_file_indices)?;
                for index in input_file_indices {
                    let level = metadata.files[index].level_or_tier;
                    if level != *lower_level && level != *upper_level {
                        return self.reject(format!(
                            "input file {} sits at level {}, not {} or {}",
                            index, level, lower_level, upper_level
                        ));
                    }
                }
                for index in input_file_indices {
                    metadata.remove_file(*index);
                }
                for index in output_file_indices {
                    metadata.add_file(*index, *upper_level);
                }
            }
            ManifestOperation::TieredCompaction {
                store_id,
                input_tiers,
                input_file_indices,
                output_file_indices,
                ..
            } => {
                let metadata = self.store_mut(manifest, store_id)?;
                if !metadata.compaction_strategy.is_tiered() {
                    return self.reject(format!("store '{}' is not tiered", store_id));
                }
                if input_tiers.len() < 2 {
                    return self.reject("tiered compaction requires at least two tiers".into());
                }
                for pair in input_tiers.windows(2) {
                    if pair[1] != pair[0] + 1 {
                        return self.reject(format!(
                            "input tiers are not consecutive: {:?}",
                            input_tiers
                        ));
                    }
                }
                self.check_inputs_outputs(metadata, input_file_indices, output_file_indices)?;
                // every file of every input tier must participate
                let expected: BTreeSet<FileIndex> = input_tiers
                    .iter()
                    .flat_map(|tier| metadata.file_indices_at(*tier))
                    .collect();
                if expected != *input_file_indices {
                    return self.reject(format!(
                        "input files {:?} do not cover tiers {:?} exactly",
                        input_file_indices, input_tiers
                    ));
                }
                let output_tier = input_tiers.last().copied().unwrap_or(0);
                for index in input_file_indices {
                    metadata.remove_file(*index);
                }
                for index in output_file_indices {
                    metadata.add_file(*index, output_tier);
                }
            }
            ManifestOperation::DeleteStore { store_id, .. } => {
                if manifest.stores.remove(store_id).is_none() {
                    return self.reject(format!("store '{}' does not exist", store_id));
                }
            }
        }
        manifest.last_sequence_number = self.sequence_number();
        Ok(())
    }

    fn store_mut<'a>(
        &self,
        manifest: &'a mut Manifest,
        store_id: &StoreId,
    ) -> Result<&'a mut StoreMetadata> {
        let sequence_number = self.sequence_number();
        manifest.stores.get_mut(store_id).ok_or_else(|| {
            StrataError::ManifestReplay {
                sequence_number,
                reason: format!("store '{}' does not exist", store_id),
            }
        })
    }

    fn check_inputs_outputs(
        &self,
        metadata: &StoreMetadata,
        inputs: &BTreeSet<FileIndex>,
        outputs: &BTreeSet<FileIndex>,
    ) -> Result<()> {
        if inputs.is_empty() {
            return self.reject("compaction requires at least one input file".into());
        }
        if outputs.is_empty() {
            return self.reject("compaction requires at least one output file".into());
        }
        for index in inputs {
            if !metadata.has_file(*index) {
                return self.reject(format!("input file {} does not exist", index));
            }
        }
        for index in outputs {
            if metadata.has_file(*index) && !inputs.contains(index) {
                return self.reject(format!("output file {} already exists", index));
            }
            if inputs.contains(index) {
                return self.reject(format!("file {} is both input and output", index));
            }
        }
        Ok(())
    }

    fn reject<T>(&self, reason: String) -> Result<T> {
        Err(StrataError::ManifestReplay {
            sequence_number: self.sequence_number(),
            reason,
        })
    }
}
