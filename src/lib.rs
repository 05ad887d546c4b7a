//! Strata - Embedded Transactional LSM Storage Engine
//!
//! An embedded key-value storage engine built around a log-structured
//! merge forest:
//!
//! - **WAL (Write-Ahead Log)**: Durability through segmented sequential writes
//! - **Manifest**: Event-sourced record of the on-disk file topology
//! - **MemTables**: In-memory skip-lists, one forest-managed tree per store
//! - **Run files**: Immutable sorted files on disk
//! - **Compaction**: Leveled or tiered background merging per store

pub mod compaction;
pub mod engine;
pub mod exec;
pub mod forest;
pub mod lsm;
pub mod manifest;
pub mod sstable;
pub mod wal;

mod error;
mod types;

pub use engine::{EngineConfig, EngineReport, ManagerState, StorageEngine, WriteBatch};
pub use error::{Result, StrataError};
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Maximum WAL segment size before rotation (16MB)
    pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

    /// Maximum total memtable bytes across all stores (256MB)
    pub const MAX_FOREST_SIZE: u64 = 256 * 1024 * 1024;

    /// Forest size at which flushes start getting scheduled (64MB)
    pub const FLUSH_THRESHOLD_SIZE: u64 = 64 * 1024 * 1024;

    /// Manifest operations tolerated before a checkpoint rewrite
    pub const CHECKPOINT_OPERATIONS_THRESHOLD: usize = 1000;

    /// Background worker threads for flush and compaction tasks
    pub const EXECUTOR_THREADS: usize = 4;

    /// Maximum run files in level 0 before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Size ratio between adjacent levels
    pub const LEVEL_SIZE_MULTIPLIER: u64 = 10;

    /// Minimum size of the base level (64MB)
    pub const BASE_LEVEL_MIN_SIZE: u64 = 64 * 1024 * 1024;

    /// Run file size limit for size-based file separation (512MB)
    pub const FILE_SEPARATION_SIZE: u64 = 512 * 1024 * 1024;
}
