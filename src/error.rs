//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Input ended before a complete record could be read
    #[error("Truncated input: {0}")]
    TruncatedInput(String),

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Manifest replay rejected an operation
    #[error("Manifest replay failed at operation {sequence_number}: {reason}")]
    ManifestReplay { sequence_number: u64, reason: String },

    /// Store not found
    #[error("Store not found: {0}")]
    StoreNotFound(String),

    /// Store already exists
    #[error("Store already exists: {0}")]
    StoreAlreadyExists(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Engine has been closed
    #[error("Storage engine is closed")]
    Closed,

    /// Engine entered panic state after an unrecoverable background failure
    #[error("Storage engine is in panic state: {0}")]
    Panicked(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StrataError::Corruption(_)
                | StrataError::ChecksumMismatch { .. }
                | StrataError::WalRecovery(_)
        )
    }

    /// Truncated input is tolerated at the tail of the active WAL file,
    /// everywhere else it is treated like corruption.
    pub fn is_truncation(&self) -> bool {
        matches!(self, StrataError::TruncatedInput(_))
    }
}
