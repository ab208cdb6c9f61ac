//! Writer lock for the ledger database file.
//!
//! DuckDB accepts a single writer process per file. The writer holds an
//! exclusive `fs2` lock on `<db>.lock` and records itself in `<db>.lock.json`
//! so a refused `tradepost` invocation can name the process in its way.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    /// Another process is the writer.
    #[error("{} is held by {}", .path.display(), describe_holder(.holder))]
    Held {
        path: PathBuf,
        holder: Option<LockHolder>,
    },

    #[error("Cannot open lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_holder(holder: &Option<LockHolder>) -> String {
    holder
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "another process".to_string())
}

/// Who holds the writer lock, as recorded in the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub exe: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            exe: std::env::current_exe()
                .ok()
                .map(|p| p.display().to_string()),
            acquired_at: Utc::now(),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)?;
        if let Some(exe) = &self.exe {
            write!(f, " ({})", exe)?;
        }
        write!(f, " since {}", self.acquired_at.to_rfc3339())
    }
}

/// The exclusive writer lock. Released on drop.
pub struct WriterLock {
    _file: File,
    lock_path: PathBuf,
    holder_path: Option<PathBuf>,
}

impl fmt::Debug for WriterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl WriterLock {
    /// Take the writer lock for `db_path` without waiting.
    pub fn acquire(db_path: &Path) -> Result<Self, LockError> {
        let lock_path = lock_path_for(db_path);
        let file = open_lock_file(&lock_path)?;

        // Fully qualified: std's File::try_lock_exclusive has a different error type.
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(lock = %lock_path.display(), "Acquired writer lock");
                let holder_path = record_holder(&lock_path);
                Ok(Self {
                    _file: file,
                    lock_path,
                    holder_path,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockError::Held {
                path: db_path.to_path_buf(),
                holder: lock_holder(db_path),
            }),
            Err(source) => Err(LockError::Io {
                path: lock_path,
                source,
            }),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Some(path) = &self.holder_path {
            if let Err(e) = fs::remove_file(path) {
                debug!(path = %path.display(), error = %e, "Could not remove lock holder record");
            }
        }
        debug!(lock = %self.lock_path.display(), "Released writer lock");
    }
}

/// `/data/ledger.duckdb` locks via `/data/ledger.duckdb.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn holder_path_for(lock_path: &Path) -> PathBuf {
    let mut name = lock_path.as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
}

/// The recorded holder of `db_path`'s writer lock, if any.
pub fn lock_holder(db_path: &Path) -> Option<LockHolder> {
    let payload = fs::read(holder_path_for(&lock_path_for(db_path))).ok()?;
    serde_json::from_slice(&payload).ok()
}

fn record_holder(lock_path: &Path) -> Option<PathBuf> {
    let path = holder_path_for(lock_path);
    let written = serde_json::to_vec_pretty(&LockHolder::current())
        .map_err(io::Error::from)
        .and_then(|payload| fs::write(&path, payload));
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not record lock holder");
            None
        }
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, LockError> {
    let io_err = |source| LockError::Io {
        path: lock_path.to_path_buf(),
        source,
    };
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(io_err)
}
