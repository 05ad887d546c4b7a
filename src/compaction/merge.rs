//! Sorted merge engine
//!
//! Combines any number of command streams that are each sorted by
//! (key, TSN) into one sorted stream, deduplicates, and drops versions
//! that no reader can see anymore.

use crate::{Command, KeyAndTsn, Result, StrataError, Tsn};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Which superseded versions of a key survive the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRetention {
    /// Keep only the newest version of each key. Valid when no reader
    /// needs historical versions from these files.
    LatestOnly,
    /// Keep every version a reader at or above this TSN could still see:
    /// all versions above it, plus the newest version at or below it.
    DropHistoryOlderThan(Tsn),
}

impl VersionRetention {
    /// Filter one key's versions, given in ascending TSN order.
    fn retain(&self, versions: &mut Vec<Command>) {
        match self {
            VersionRetention::LatestOnly => {
                if versions.len() > 1 {
                    versions.drain(..versions.len() - 1);
                }
            }
            VersionRetention::DropHistoryOlderThan(tsn) => {
                // newest version at or below the watermark stays visible
                let keep_from = versions
                    .iter()
                    .rposition(|c| c.tsn() <= *tsn)
                    .unwrap_or(0);
                versions.drain(..keep_from);
            }
        }
    }
}

#[derive(PartialEq, Eq)]
struct HeapItem {
    key: KeyAndTsn,
    source: usize,
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key).then(self.source.cmp(&other.source))
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// K-way merge over sorted command streams.
///
/// Checks that every source is strictly ascending (a violation is
/// corruption, the merge output would silently lose data otherwise) and
/// drops exact duplicates that can appear when a file participates in
/// overlapping merges.
pub struct MergeIterator<I> {
    sources: Vec<I>,
    heap: BinaryHeap<Reverse<HeapItem>>,
    pending: Vec<Option<Command>>,
    last_emitted: Option<KeyAndTsn>,
    failed: bool,
}

impl<I> MergeIterator<I>
where
    I: Iterator<Item = Result<Command>>,
{
    pub fn new(mut sources: Vec<I>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        let mut pending = Vec::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            match iter.next().transpose()? {
                Some(command) => {
                    heap.push(Reverse(HeapItem {
                        key: command.key_and_tsn(),
                        source,
                    }));
                    pending.push(Some(command));
                }
                None => pending.push(None),
            }
        }
        Ok(Self {
            sources,
            heap,
            pending,
            last_emitted: None,
            failed: false,
        })
    }

    fn refill(&mut self, source: usize, previous: &KeyAndTsn) -> Result<()> {
        if let Some(command) = self.sources[source].next().transpose()? {
            let key = command.key_and_tsn();
            if key <= *previous {
                return Err(StrataError::Corruption(format!(
                    "merge input {} is not sorted: {:?} after {:?}",
                    source, key, previous
                )));
            }
            self.heap.push(Reverse(HeapItem { key, source }));
            self.pending[source] = Some(command);
        }
        Ok(())
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator<Item = Result<Command>>,
{
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let Reverse(item) = self.heap.pop()?;
            let command = self.pending[item.source]
                .take()
                .expect("heap item always has a pending command");
            if let Err(e) = self.refill(item.source, &item.key) {
                self.failed = true;
                return Some(Err(e));
            }
            // exact duplicate across sources
            if self.last_emitted.as_ref() == Some(&item.key) {
                continue;
            }
            self.last_emitted = Some(item.key);
            return Some(Ok(command));
        }
    }
}

/// Applies version retention and tombstone dropping on top of a sorted,
/// deduplicated command stream.
///
/// With `keep_tombstones = false` (output is the deepest level or tier,
/// nothing lies below it) tombstones with no surviving older version of
/// their key are removed.
pub struct VersionFilterIterator<I: Iterator<Item = Result<Command>>> {
    input: std::iter::Peekable<I>,
    retention: VersionRetention,
    keep_tombstones: bool,
    buffered: std::vec::IntoIter<Command>,
    failed: bool,
}

impl<I> VersionFilterIterator<I>
where
    I: Iterator<Item = Result<Command>>,
{
    pub fn new(input: I, retention: VersionRetention, keep_tombstones: bool) -> Self {
        Self {
            input: input.peekable(),
            retention,
            keep_tombstones,
            buffered: Vec::new().into_iter(),
            failed: false,
        }
    }

    /// Pull all versions of the next key and filter them.
    fn fill_buffer(&mut self) -> Result<()> {
        let first = match self.input.next().transpose()? {
            Some(command) => command,
            None => return Ok(()),
        };
        let mut versions = vec![first];
        while let Some(Ok(next)) = self.input.peek() {
            if next.key() != versions[0].key() {
                break;
            }
            let next = self
                .input
                .next()
                .expect("peeked element exists")
                .expect("peeked element was Ok");
            versions.push(next);
        }
        self.retention.retain(&mut versions);
        if !self.keep_tombstones {
            // a tombstone with nothing under it hides nothing
            let live_from = versions
                .iter()
                .position(|c| !c.is_tombstone())
                .unwrap_or(versions.len());
            versions.drain(..live_from);
        }
        self.buffered = versions.into_iter();
        Ok(())
    }
}

impl<I> Iterator for VersionFilterIterator<I>
where
    I: Iterator<Item = Result<Command>>,
{
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(command) = self.buffered.next() {
                return Some(Ok(command));
            }
            if self.input.peek().is_none() {
                return None;
            }
            if let Err(e) = self.fill_buffer() {
                self.failed = true;
                return Some(Err(e));
            }
        }
    }
}

/// Full merge pipeline: k-way merge, dedup, version retention, tombstone
/// policy.
pub fn merge_commands<I>(
    sources: Vec<I>,
    retention: VersionRetention,
    keep_tombstones: bool,
) -> Result<impl Iterator<Item = Result<Command>>>
where
    I: Iterator<Item = Result<Command>>,
{
    let merged = MergeIterator::new(sources)?;
    Ok(VersionFilterIterator::new(merged, retention, keep_tombstones))
}
