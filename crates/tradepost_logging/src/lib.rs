//! Logging setup and home directory layout for Tradepost binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "tradepost=info,tradepost_db=info";
const VERBOSE_LOG_FILTER: &str = "tradepost=debug,tradepost_db=debug";
const QUIET_CONSOLE_FILTER: &str = "warn";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "TRADEPOST_HOME";

/// Logging configuration for a Tradepost binary.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter (or debug, if RUST_LOG is unset) to stderr.
    pub verbose: bool,
}

/// Initialize tracing with a rolling file writer under [`logs_dir`] and stderr output.
///
/// `RUST_LOG` overrides the file filter. Without `verbose`, stderr only
/// carries warnings and errors so command output stays readable.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedLog::open(&log_dir, config.app_name)?;

    let env_filter = std::env::var("RUST_LOG").ok().filter(|v| !v.is_empty());
    let file_filter = match &env_filter {
        Some(directives) => EnvFilter::new(directives),
        None if config.verbose => EnvFilter::new(VERBOSE_LOG_FILTER),
        None => EnvFilter::new(DEFAULT_LOG_FILTER),
    };
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new(QUIET_CONSOLE_FILTER)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

/// Tradepost home directory: `$TRADEPOST_HOME`, else `~/.tradepost`.
///
/// Falls back to `./.tradepost` when no home directory can be determined.
pub fn tradepost_home() -> PathBuf {
    if let Ok(override_path) = std::env::var(HOME_ENV) {
        if !override_path.is_empty() {
            return PathBuf::from(override_path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tradepost")
}

/// Logs directory: `<home>/logs`
pub fn logs_dir() -> PathBuf {
    tradepost_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped log file with numbered backups: `<name>.log`, `<name>.log.1`, ...
struct LogFile {
    dir: PathBuf,
    name: String,
    keep: usize,
    max_bytes: u64,
    file: Option<File>,
    written: u64,
}

impl LogFile {
    fn open(dir: &Path, app_name: &str, keep: usize, max_bytes: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let name: String = app_name
            .chars()
            .map(|ch| match ch {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
                _ => '_',
            })
            .collect();
        let mut log = Self {
            dir: dir.to_path_buf(),
            name,
            keep: keep.max(1),
            max_bytes,
            file: None,
            written: 0,
        };
        log.reopen()?;
        if log.written > log.max_bytes {
            log.roll()?;
        }
        Ok(log)
    }

    fn path(&self, generation: usize) -> PathBuf {
        match generation {
            0 => self.dir.join(format!("{}.log", self.name)),
            n => self.dir.join(format!("{}.log.{}", self.name, n)),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(0))?;
        self.written = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    /// Move every generation up by one; the oldest beyond `keep` is lost.
    fn roll(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        if self.keep == 1 {
            File::create(self.path(0))?;
        } else {
            remove_if_present(&self.path(self.keep - 1))?;
            for generation in (0..self.keep - 1).rev() {
                rename_if_present(&self.path(generation), &self.path(generation + 1))?;
            }
        }
        self.reopen()
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.roll()?;
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log file is closed"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().map_or(Ok(()), |f| f.flush())
    }
}

/// `MakeWriter` handle shared by every event; each write takes the lock.
#[derive(Clone)]
struct SharedLog(Arc<Mutex<LogFile>>);

impl SharedLog {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let log = LogFile::open(dir, app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self(Arc::new(Mutex::new(log))))
    }

    fn with<T>(&self, f: impl FnOnce(&mut LogFile) -> io::Result<T>) -> io::Result<T> {
        let mut log = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut log)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLog {
    type Writer = SharedLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for SharedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|log| log.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|log| log.flush())
    }
}
