//! Forest memory manager
//!
//! All memtables of all stores share one memory budget, the "forest".
//! The manager keeps two numbers per tree: the *virtual* size (bytes not
//! yet handed to a flush) and the *actual* size (bytes still held in
//! memory, flushed or not). Crossing the flush threshold schedules
//! flushes for the fattest trees; crossing the hard limit stalls writers
//! until a flush completes.

use crate::StoreId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Receives flush requests decided by the memory manager.
pub trait FlushScheduler: Send + Sync {
    fn schedule_flush(&self, store_id: &StoreId);
}

#[derive(Debug, Default, Clone, Copy)]
struct TreeSizes {
    /// Bytes accumulated since the last flush was scheduled.
    virtual_bytes: u64,
    /// Bytes currently held in memory for the tree.
    actual_bytes: u64,
}

#[derive(Default)]
struct ForestState {
    trees: HashMap<StoreId, TreeSizes>,
}

impl ForestState {
    fn virtual_total(&self) -> u64 {
        self.trees.values().map(|t| t.virtual_bytes).sum()
    }

    fn actual_total(&self) -> u64 {
        self.trees.values().map(|t| t.actual_bytes).sum()
    }

    fn largest_virtual(&self) -> Option<(StoreId, u64)> {
        self.trees
            .iter()
            .max_by_key(|(_, sizes)| sizes.virtual_bytes)
            .map(|(store_id, sizes)| (store_id.clone(), sizes.virtual_bytes))
    }
}

/// Admission control for memtable memory across all stores.
pub struct ForestMemoryManager {
    max_forest_size: u64,
    flush_threshold_size: u64,
    state: Mutex<ForestState>,
    space_freed: Condvar,
    /// Accumulated time writers spent blocked on the hard limit.
    stall_micros: AtomicU64,
}

impl ForestMemoryManager {
    pub fn new(max_forest_size: u64, flush_threshold_size: u64) -> Self {
        Self {
            max_forest_size,
            flush_threshold_size,
            state: Mutex::new(ForestState::default()),
            space_freed: Condvar::new(),
            stall_micros: AtomicU64::new(0),
        }
    }

    /// Account `bytes` of fresh writes to a tree.
    ///
    /// Schedules flushes while the forest-wide virtual size sits at or
    /// above the flush threshold, then blocks the caller while the
    /// actual size sits at or above the hard limit.
    pub fn add_size(&self, store_id: &StoreId, bytes: u64, scheduler: &dyn FlushScheduler) {
        let mut state = self.state.lock();
        let sizes = state.trees.entry(store_id.clone()).or_default();
        sizes.virtual_bytes += bytes;
        sizes.actual_bytes += bytes;

        while state.virtual_total() >= self.flush_threshold_size {
            let Some((fattest, virtual_bytes)) = state.largest_virtual() else {
                break;
            };
            if virtual_bytes == 0 {
                // everything is already on its way to disk
                break;
            }
            if let Some(sizes) = state.trees.get_mut(&fattest) {
                sizes.virtual_bytes = 0;
            }
            debug!(store = %fattest, virtual_bytes, "scheduling flush for largest tree");
            scheduler.schedule_flush(&fattest);
        }

        let mut stalled_at: Option<Instant> = None;
        while state.actual_total() >= self.max_forest_size {
            if stalled_at.is_none() {
                info!(
                    store = %store_id,
                    actual = state.actual_total(),
                    limit = self.max_forest_size,
                    "forest is full, stalling writer"
                );
                stalled_at = Some(Instant::now());
            }
            self.space_freed.wait(&mut state);
        }
        if let Some(started) = stalled_at {
            let waited = started.elapsed();
            self.stall_micros
                .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
            info!(store = %store_id, waited_ms = waited.as_millis() as u64, "writer resumed");
        }
    }

    /// Seed the accounting for a tree whose memtable was rebuilt from
    /// the log on open.
    pub fn restore_size(&self, store_id: &StoreId, bytes: u64) {
        let mut state = self.state.lock();
        let sizes = state.trees.entry(store_id.clone()).or_default();
        sizes.virtual_bytes = bytes;
        sizes.actual_bytes = bytes;
    }

    /// A flush for the tree completed; `remaining_bytes` is what the
    /// tree still holds in memory. Wakes stalled writers when the flush
    /// actually freed memory; a flush that removed nothing leaves the
    /// accounting untouched.
    pub fn flush_completed(&self, store_id: &StoreId, remaining_bytes: u64) {
        let mut state = self.state.lock();
        let sizes = state.trees.entry(store_id.clone()).or_default();
        if remaining_bytes >= sizes.actual_bytes {
            return;
        }
        let removed = sizes.actual_bytes - remaining_bytes;
        sizes.actual_bytes = remaining_bytes;
        sizes.virtual_bytes = sizes.virtual_bytes.min(remaining_bytes);
        trace!(store = %store_id, removed, remaining_bytes, "flush completed");
        self.space_freed.notify_all();
    }

    /// Schedule a flush for every tree that still holds unflushed data.
    pub fn flush_all_trees(&self, scheduler: &dyn FlushScheduler) {
        let mut state = self.state.lock();
        let stores: Vec<StoreId> = state
            .trees
            .iter()
            .filter(|(_, sizes)| sizes.virtual_bytes > 0)
            .map(|(store_id, _)| store_id.clone())
            .collect();
        for store_id in stores {
            if let Some(sizes) = state.trees.get_mut(&store_id) {
                sizes.virtual_bytes = 0;
            }
            scheduler.schedule_flush(&store_id);
        }
    }

    /// Forget a deleted tree and release its budget.
    pub fn remove_tree(&self, store_id: &StoreId) {
        let mut state = self.state.lock();
        state.trees.remove(store_id);
        self.space_freed.notify_all();
    }

    pub fn actual_forest_size(&self) -> u64 {
        self.state.lock().actual_total()
    }

    /// Total time writers have spent stalled on the hard limit.
    pub fn total_stall_duration(&self) -> Duration {
        Duration::from_micros(self.stall_micros.load(Ordering::Relaxed))
    }
}
