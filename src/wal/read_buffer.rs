//! Replay sink used during WAL recovery

use crate::{Command, StoreId, Tsn};
use std::collections::HashMap;

/// Collects the committed commands of a WAL replay, filtered per store by
/// a low watermark.
///
/// A command needs replay only if its TSN lies above the store's persisted
/// maximum TSN; everything at or below the watermark is already durable in
/// run files, which makes replay idempotent.
#[derive(Debug, Default)]
pub struct WalReadBuffer {
    low_watermarks: HashMap<StoreId, Tsn>,
    commands: HashMap<StoreId, Vec<Command>>,
    highest_completed_tsn: Tsn,
}

impl WalReadBuffer {
    /// `low_watermarks`: per store, the highest TSN already persisted in
    /// run files. Stores absent from the map replay everything.
    pub fn new(low_watermarks: HashMap<StoreId, Tsn>) -> Self {
        Self {
            low_watermarks,
            commands: HashMap::new(),
            highest_completed_tsn: 0,
        }
    }

    /// Whether a command with this TSN must be re-applied to the store.
    pub fn needs_replay(&self, store_id: &StoreId, tsn: Tsn) -> bool {
        match self.low_watermarks.get(store_id) {
            Some(watermark) => tsn > *watermark,
            None => true,
        }
    }

    /// Buffer a committed command, subject to the watermark filter.
    pub fn add_command(&mut self, store_id: StoreId, command: Command) {
        if !self.needs_replay(&store_id, command.tsn()) {
            return;
        }
        self.commands.entry(store_id).or_default().push(command);
    }

    /// Record a committed transaction, regardless of whether any of its
    /// commands survived the filter.
    pub fn mark_completed(&mut self, tsn: Tsn) {
        self.highest_completed_tsn = self.highest_completed_tsn.max(tsn);
    }

    /// Highest TSN that has a commit entry in the WAL.
    pub fn highest_completed_tsn(&self) -> Tsn {
        self.highest_completed_tsn
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drain the buffered commands, per store.
    pub fn into_commands(self) -> HashMap<StoreId, Vec<Command>> {
        self.commands
    }
}
