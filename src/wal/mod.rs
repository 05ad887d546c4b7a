//! Write-Ahead Log
//!
//! The WAL is a sequence of segment files `wal_<seq>.log` with contiguous
//! sequence numbers. Only the highest-numbered segment is written to; all
//! others are sealed. A transaction becomes durable when its commit entry
//! is fsynced; entries after the last commit in the active segment are
//! discarded at recovery.

pub mod entry;
pub mod file;
pub mod read_buffer;

pub use entry::{WalEntry, WalEntryStream};
pub use file::{WalFile, WalSummaryFile};
pub use read_buffer::WalReadBuffer;

use crate::{Command, Result, StoreId, StrataError, Tsn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Segment size after which appends rotate to a new segment. Entries
    /// never span segments; transactions may.
    pub max_segment_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

/// Name and size of one WAL segment, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFileReport {
    pub file_name: String,
    pub size_bytes: u64,
}

struct WalInner {
    /// Segments in ascending sequence order; the last one is active.
    files: Vec<WalFile>,
    writer: File,
    active_size: u64,
}

impl WalInner {
    fn active(&self) -> &WalFile {
        self.files.last().expect("WAL always has an active segment")
    }
}

/// The segmented write-ahead log of the storage engine.
pub struct WriteAheadLog {
    dir: PathBuf,
    config: WalConfig,
    summary: WalSummaryFile,
    inner: RwLock<WalInner>,
    /// Held across a whole shortening run; `try_lock` keeps it single-flight.
    shorten_lock: Mutex<()>,
}

impl WriteAheadLog {
    /// Open the WAL in `dir`, running crash recovery.
    ///
    /// Recovery deletes leftovers of an interrupted shortening, verifies
    /// segment contiguity, validates sealed-segment checksums, discards
    /// trailing segments without a committed transaction and truncates
    /// the newest remaining segment back to its last commit entry.
    ///
    /// `max_persisted_tsn` is the highest TSN already covered by run
    /// files. The log must contain a commit at or above it; a log that
    /// ends earlier (or is missing entirely while run files exist) was
    /// lost or rolled back and is rejected as corrupt.
    pub fn open(dir: &Path, config: WalConfig, max_persisted_tsn: Tsn) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let summary = WalSummaryFile::new(dir);
        let highest_dropped = summary.read()?;

        let mut files = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            if let Some(seq) = WalFile::parse_sequence_number(&name.to_string_lossy()) {
                files.push(WalFile::new(dir, seq));
            }
        }
        files.sort_by_key(|f| f.sequence_number());

        // Files at or below the summary watermark are leftovers of a
        // shortening that crashed between persisting the summary and
        // deleting the files.
        if let Some(dropped) = highest_dropped {
            let leftovers: Vec<_> = files
                .iter()
                .filter(|f| f.sequence_number() <= dropped)
                .cloned()
                .collect();
            for leftover in &leftovers {
                info!(
                    file = %leftover.path().display(),
                    "deleting WAL segment left over from interrupted shortening"
                );
                leftover.delete()?;
            }
            files.retain(|f| f.sequence_number() > dropped);
            if !leftovers.is_empty() {
                file::fsync_dir(dir)?;
            }
        }

        if !files.is_empty() {
            Self::check_contiguity(&files, highest_dropped)?;

            // After a crash the page cache and disk may disagree; force
            // the segments down before reading them back.
            for wal_file in &files {
                wal_file.sync()?;
            }

            let (sealed, _) = files.split_at(files.len() - 1);
            for wal_file in sealed {
                wal_file.validate_checksum()?;
            }
        }

        let active_size = Self::recover(dir, &mut files, max_persisted_tsn, highest_dropped)?;

        let writer = files
            .last()
            .expect("WAL always has an active segment")
            .open_for_append()?;

        info!(
            dir = %dir.display(),
            segments = files.len(),
            active = files.last().map(|f| f.sequence_number()).unwrap_or(0),
            "write-ahead log opened"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            summary,
            inner: RwLock::new(WalInner {
                files,
                writer,
                active_size,
            }),
            shorten_lock: Mutex::new(()),
        })
    }

    fn check_contiguity(files: &[WalFile], highest_dropped: Option<u64>) -> Result<()> {
        let first = files[0].sequence_number();
        if let Some(dropped) = highest_dropped {
            if first != dropped + 1 {
                return Err(StrataError::WalRecovery(format!(
                    "WAL summary reports {} dropped but lowest segment is {}",
                    dropped, first
                )));
            }
        }
        for (offset, wal_file) in files.iter().enumerate() {
            let expected = first + offset as u64;
            if wal_file.sequence_number() != expected {
                return Err(StrataError::WalRecovery(format!(
                    "WAL segment sequence gap: expected {}, found {}",
                    expected,
                    wal_file.sequence_number()
                )));
            }
        }
        Ok(())
    }

    /// Walk the segments newest to oldest, deleting trailing segments
    /// without a committed transaction, then cut the newest remaining
    /// segment back to the end of its last commit entry.
    ///
    /// Returns the resulting active segment size. Creates a fresh first
    /// segment when no segment survives, which is only legal while no
    /// run file holds persisted data yet.
    fn recover(
        dir: &Path,
        files: &mut Vec<WalFile>,
        max_persisted_tsn: Tsn,
        highest_dropped: Option<u64>,
    ) -> Result<u64> {
        let mut last_commit: Option<(Tsn, u64)> = None;
        let mut deleted = 0usize;
        while let Some(newest) = files.last() {
            if let Some(found) = Self::scan_for_last_commit(newest)? {
                last_commit = Some(found);
                break;
            }
            info!(
                file = %newest.path().display(),
                "discarding WAL segment without a committed transaction"
            );
            newest.delete()?;
            files.pop();
            deleted += 1;
        }
        if deleted > 0 {
            file::fsync_dir(dir)?;
        }

        let Some((commit_tsn, commit_boundary)) = last_commit else {
            if max_persisted_tsn > 0 {
                return Err(StrataError::WalRecovery(format!(
                    "no committed transaction found in the log, but run files \
                     hold data up to TSN {}",
                    max_persisted_tsn
                )));
            }
            let first_seq = highest_dropped.map(|d| d + 1).unwrap_or(1);
            files.push(WalFile::create(dir, first_seq)?);
            return Ok(0);
        };

        if commit_tsn < max_persisted_tsn {
            return Err(StrataError::WalRecovery(format!(
                "log ends at commit TSN {}, but run files hold data up to TSN {}",
                commit_tsn, max_persisted_tsn
            )));
        }

        let active = files.last().expect("a segment with a commit remains");
        let total = active.size()?;
        if commit_boundary < total {
            info!(
                file = %active.path().display(),
                from = total,
                to = commit_boundary,
                "truncating active WAL segment to last commit"
            );
            active.truncate_to(commit_boundary)?;
        }
        // the segment will grow again, a stale sidecar must not outlive it
        active.delete_checksum_file()?;
        Ok(commit_boundary)
    }

    /// Find the last commit entry of a segment: its TSN and the byte
    /// offset just past it. Unreadable tail bytes end the scan.
    fn scan_for_last_commit(wal_file: &WalFile) -> Result<Option<(Tsn, u64)>> {
        let mut stream = WalEntryStream::new(wal_file.read_all()?);
        let mut last: Option<(Tsn, u64)> = None;
        while let Some(item) = stream.next() {
            match item {
                Ok(WalEntry::TransactionCommit { tsn }) => {
                    last = Some((tsn, stream.consumed_bytes()));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        file = %wal_file.path().display(),
                        offset = stream.consumed_bytes(),
                        error = %e,
                        "unreadable tail in WAL segment"
                    );
                    break;
                }
            }
        }
        Ok(last)
    }

    /// Append entries and fsync. Rotates to a new segment at entry
    /// boundaries once the active segment exceeds its size limit.
    pub fn append(&self, entries: &[WalEntry]) -> Result<()> {
        let mut inner = self.inner.write();
        for entry in entries {
            if inner.active_size >= self.config.max_segment_size {
                self.rotate(&mut *inner)?;
            }
            let bytes = entry.serialize();
            inner.writer.write_all(&bytes)?;
            inner.active_size += bytes.len() as u64;
        }
        inner.writer.flush()?;
        inner.writer.sync_all()?;
        Ok(())
    }

    fn rotate(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        inner.writer.sync_all()?;
        let next_seq = inner.active().sequence_number() + 1;
        let new_file = WalFile::create(&self.dir, next_seq)?;
        debug!(
            sealed = inner.active().sequence_number(),
            new = next_seq,
            "rotating WAL segment"
        );
        inner.writer = new_file.open_for_append()?;
        inner.files.push(new_file);
        inner.active_size = 0;
        Ok(())
    }

    /// Replay all committed transactions into `buffer`.
    ///
    /// Commands are grouped by their TSN until the matching commit entry
    /// is seen; transactions without a commit are discarded, and entries
    /// before the first transaction start belong to a transaction whose
    /// start was dropped with an older segment and are skipped. Errors in
    /// sealed segments are fatal, the active segment was already cut back
    /// to its last commit at open.
    pub fn replay_into(&self, buffer: &mut WalReadBuffer) -> Result<()> {
        let inner = self.inner.read();
        let mut open_transactions: HashMap<Tsn, Vec<(StoreId, Command)>> = HashMap::new();
        let mut seen_start = false;
        let last_index = inner.files.len() - 1;

        for (index, wal_file) in inner.files.iter().enumerate() {
            let is_active = index == last_index;
            let stream = WalEntryStream::new(wal_file.read_all()?);
            for item in stream {
                let entry = match item {
                    Ok(entry) => entry,
                    Err(e) if is_active && e.is_truncation() => break,
                    Err(e) => {
                        return Err(StrataError::WalRecovery(format!(
                            "unreadable entry in sealed WAL segment {}: {}",
                            wal_file.sequence_number(),
                            e
                        )))
                    }
                };
                match entry {
                    WalEntry::TransactionStart { tsn } => {
                        seen_start = true;
                        open_transactions.entry(tsn).or_default();
                    }
                    // the tail of a transaction whose start was dropped
                    // with an earlier segment
                    _ if !seen_start => continue,
                    WalEntry::TransactionCommand { store_id, command } => {
                        let tsn = command.tsn();
                        match open_transactions.get_mut(&tsn) {
                            Some(commands) => commands.push((store_id, command)),
                            None => {
                                return Err(StrataError::WalRecovery(format!(
                                    "WAL command for TSN {} without transaction start",
                                    tsn
                                )))
                            }
                        }
                    }
                    WalEntry::TransactionCommit { tsn } => {
                        let commands = open_transactions.remove(&tsn).ok_or_else(|| {
                            StrataError::WalRecovery(format!(
                                "WAL commit for TSN {} without transaction start",
                                tsn
                            ))
                        })?;
                        for (store_id, command) in commands {
                            buffer.add_command(store_id, command);
                        }
                        buffer.mark_completed(tsn);
                    }
                }
            }
        }

        if !open_transactions.is_empty() {
            let mut tsns: Vec<_> = open_transactions.keys().copied().collect();
            tsns.sort_unstable();
            warn!(?tsns, "discarding uncommitted transactions from WAL replay");
        }
        Ok(())
    }

    /// Drop leading sealed segments whose transactions are all committed
    /// with TSN at or below `low_watermark`.
    ///
    /// A segment is only droppable if no transaction reaches past its end,
    /// otherwise the tail of that transaction in the next segment would be
    /// orphaned. The summary file is persisted before any deletion so an
    /// interrupted run only leaves deletable leftovers.
    ///
    /// Returns the number of segments dropped. Concurrent calls collapse
    /// into one; the loser returns 0 immediately.
    pub fn shorten(&self, low_watermark: Tsn) -> Result<usize> {
        let _guard = match self.shorten_lock.try_lock() {
            Some(guard) => guard,
            None => return Ok(0),
        };

        let sealed: Vec<WalFile> = {
            let inner = self.inner.read();
            inner.files[..inner.files.len() - 1].to_vec()
        };
        if sealed.is_empty() {
            return Ok(0);
        }

        let mut droppable_end: Option<usize> = None;
        let mut open_tsns: std::collections::HashSet<Tsn> = std::collections::HashSet::new();
        let mut max_tsn_seen: Tsn = 0;

        'files: for (index, wal_file) in sealed.iter().enumerate() {
            for item in WalEntryStream::new(wal_file.read_all()?) {
                let entry = item.map_err(|e| {
                    StrataError::WalRecovery(format!(
                        "unreadable entry in sealed WAL segment {} during shortening: {}",
                        wal_file.sequence_number(),
                        e
                    ))
                })?;
                match entry {
                    WalEntry::TransactionStart { tsn } => {
                        open_tsns.insert(tsn);
                        max_tsn_seen = max_tsn_seen.max(tsn);
                    }
                    WalEntry::TransactionCommand { ref command, .. } => {
                        max_tsn_seen = max_tsn_seen.max(command.tsn());
                    }
                    WalEntry::TransactionCommit { tsn } => {
                        open_tsns.remove(&tsn);
                        max_tsn_seen = max_tsn_seen.max(tsn);
                    }
                }
            }
            if max_tsn_seen > low_watermark {
                break 'files;
            }
            // walk-back: a segment ending inside a transaction stays
            if open_tsns.is_empty() {
                droppable_end = Some(index);
            }
        }

        let Some(end) = droppable_end else {
            return Ok(0);
        };
        let to_drop = &sealed[..=end];
        let highest_dropped = to_drop
            .last()
            .expect("droppable prefix is non-empty")
            .sequence_number();

        self.summary.write(highest_dropped)?;
        for wal_file in to_drop {
            wal_file.delete()?;
        }
        file::fsync_dir(&self.dir)?;

        {
            let mut inner = self.inner.write();
            inner.files.retain(|f| f.sequence_number() > highest_dropped);
        }

        info!(
            dropped = to_drop.len(),
            highest_dropped, low_watermark, "shortened write-ahead log"
        );
        Ok(to_drop.len())
    }

    /// Write sidecar checksums for all sealed segments that lack one.
    pub fn generate_checksums_for_completed_files(&self) -> Result<()> {
        let sealed: Vec<WalFile> = {
            let inner = self.inner.read();
            inner.files[..inner.files.len() - 1].to_vec()
        };
        for wal_file in sealed {
            wal_file.create_checksum_file_if_missing()?;
        }
        Ok(())
    }

    /// Current segment names and sizes, oldest first.
    pub fn report(&self) -> Result<Vec<WalFileReport>> {
        let inner = self.inner.read();
        inner
            .files
            .iter()
            .map(|f| {
                Ok(WalFileReport {
                    file_name: WalFile::file_name(f.sequence_number()),
                    size_bytes: f.size()?,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn segment_count(&self) -> usize {
        self.inner.read().files.len()
    }
}
