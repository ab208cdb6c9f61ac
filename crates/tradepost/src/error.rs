//! Error types for the scan ledger

use crate::types::Dimension;
use std::io;
use thiserror::Error;

/// Ledger error type
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed or incomplete input rejected before it reaches the reconcilers.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A scan with the same natural key is already recorded. Nothing was written.
    #[error(
        "Duplicate scan from '{sender_id}' for {dimension} chunk ({chunk_x}, {chunk_z}) at {scanned_at}"
    )]
    DuplicateScan {
        sender_id: String,
        dimension: Dimension,
        chunk_x: i32,
        chunk_z: i32,
        scanned_at: i64,
    },

    /// Stored state breaks an invariant (e.g. two active versions at one Position).
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] tradepost_db::BackendError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// True for the recoverable duplicate-scan conflict.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateScan { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, LedgerError>;
