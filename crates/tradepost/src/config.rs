//! Configuration for the ledger

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `database_path` when set.
pub const DATABASE_ENV: &str = "TRADEPOST_DB";

/// Main configuration for a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to the DuckDB ledger file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Recompute every nearest-waystone annotation after a writable open
    #[serde(default = "default_repair_nearest_on_open")]
    pub repair_nearest_on_open: bool,

    /// Upper bound for offer listings
    #[serde(default = "default_max_offer_limit")]
    pub max_offer_limit: usize,

    /// Offer listing size when the caller gives none
    #[serde(default = "default_offer_limit")]
    pub default_offer_limit: usize,

    /// Upper bound for chunk summary pages
    #[serde(default = "default_max_chunk_limit")]
    pub max_chunk_limit: usize,

    /// Chunk summary page size when the caller gives none
    #[serde(default = "default_chunk_limit")]
    pub default_chunk_limit: usize,
}

fn default_database_path() -> PathBuf {
    tradepost_logging::tradepost_home().join("tradepost.duckdb")
}

fn default_repair_nearest_on_open() -> bool {
    true
}

fn default_max_offer_limit() -> usize {
    10
}

fn default_offer_limit() -> usize {
    3
}

fn default_max_chunk_limit() -> usize {
    1000
}

fn default_chunk_limit() -> usize {
    500
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            repair_nearest_on_open: default_repair_nearest_on_open(),
            max_offer_limit: default_max_offer_limit(),
            default_offer_limit: default_offer_limit(),
            max_chunk_limit: default_max_chunk_limit(),
            default_chunk_limit: default_chunk_limit(),
        }
    }
}

impl LedgerConfig {
    /// Config for a ledger file at `path`, everything else defaulted.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LedgerError::Config(e.to_string()))
    }

    /// Load `path` if given (defaults otherwise), then apply [`DATABASE_ENV`].
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(db) = std::env::var_os(DATABASE_ENV).filter(|v| !v.is_empty()) {
            config.database_path = PathBuf::from(db);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_offer_limit == 0 {
            return Err(LedgerError::Config("max_offer_limit must be at least 1".to_string()));
        }
        if self.default_offer_limit == 0 || self.default_offer_limit > self.max_offer_limit {
            return Err(LedgerError::Config(format!(
                "default_offer_limit must be between 1 and max_offer_limit ({})",
                self.max_offer_limit
            )));
        }
        if self.default_chunk_limit > self.max_chunk_limit {
            return Err(LedgerError::Config(format!(
                "default_chunk_limit must not exceed max_chunk_limit ({})",
                self.max_chunk_limit
            )));
        }
        Ok(())
    }
}
