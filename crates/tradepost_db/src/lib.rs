//! Embedded storage backend for the Tradepost scan ledger.
//!
//! All ledger state lives in a single DuckDB file. DuckDB allows one writer
//! process per file, so writable connections hold an exclusive lock file
//! beside the database for as long as they are open. Read-only connections
//! coexist with the writer and see the last committed snapshot.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tradepost_db::{BackendError, DbConnection};
//!
//! let conn = DbConnection::open(Path::new("ledger.duckdb"))?;
//! conn.transaction(|tx| {
//!     tx.execute("UPDATE shop_states SET removed_at = ? WHERE id = ?", &[now.into(), id.into()])?;
//!     Ok::<_, BackendError>(())
//! })?;
//! ```

pub mod backend;
pub mod lock;

pub use backend::{
    AccessMode, BackendError, DbConnection, DbRow, DbTransaction, DbValue, FromDbValue,
};
pub use lock::{lock_holder, lock_path_for, LockError, LockHolder, WriterLock};

/// Milliseconds since the Unix epoch as a UTC datetime. Out-of-range values clamp to the epoch.
pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
