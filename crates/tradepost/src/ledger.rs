//! The ledger handle: one DuckDB connection plus its configuration.

use crate::batch::ScanBatch;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, Result};
use crate::ingest;
use crate::nearest::{recompute_nearest, Invalidation};
use crate::query::{self, ChunkQuery, ChunkSummary, OfferBook, OfferQuery, ShopFilter, WaystoneFilter};
use crate::schema::{ensure_schema, validate_schema};
use crate::types::{
    Dimension, IngestOptions, IngestReport, NearestWaystone, NewScan, Position, RebuildReport,
    ShopObservation, ShopState, WaystoneObservation, WaystoneState,
};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use tradepost_db::DbConnection;

/// Scan ledger over a single DuckDB file.
pub struct ScanLedger {
    conn: DbConnection,
    config: LedgerConfig,
}

impl std::fmt::Debug for ScanLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanLedger")
            .field("database_path", &self.config.database_path)
            .field("access_mode", &self.conn.access_mode())
            .finish()
    }
}

impl ScanLedger {
    /// Open for writing. Holds the single-writer lock until dropped.
    ///
    /// Creates the schema if needed and, unless disabled, recomputes every
    /// nearest-waystone annotation.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = DbConnection::open(&config.database_path)?;
        ensure_schema(&conn)?;
        let ledger = Self { conn, config };
        if ledger.config.repair_nearest_on_open {
            let repaired = ledger.recompute_nearest(&Invalidation::everything())?;
            info!(
                path = %ledger.config.database_path.display(),
                annotations = repaired,
                "Nearest-waystone annotations repaired on open"
            );
        }
        Ok(ledger)
    }

    /// Open an existing ledger for queries. Takes no lock.
    pub fn open_readonly(config: LedgerConfig) -> Result<Self> {
        if !config.database_path.exists() {
            return Err(LedgerError::Config(format!(
                "Ledger not found at {}",
                config.database_path.display()
            )));
        }
        let conn = DbConnection::open_readonly(&config.database_path)?;
        validate_schema(&conn)?;
        Ok(Self { conn, config })
    }

    /// Throwaway in-memory ledger.
    pub fn open_in_memory() -> Result<Self> {
        let conn = DbConnection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn,
            config: LedgerConfig::at(":memory:"),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn connection(&self) -> &DbConnection {
        &self.conn
    }

    /// Ingest one scan atomically. Fails with [`LedgerError::DuplicateScan`]
    /// when the scan's natural key is already recorded.
    pub fn ingest_scan(
        &self,
        scan: &NewScan,
        shops: &[ShopObservation],
        waystones: &[WaystoneObservation],
        options: IngestOptions,
    ) -> Result<IngestReport> {
        ingest::ingest_scan(&self.conn, scan, shops, waystones, options)
    }

    /// Validate a client batch and ingest it.
    pub fn ingest_batch(&self, batch: &ScanBatch) -> Result<IngestReport> {
        let validated = batch.validate(Utc::now())?;
        if validated.dropped_incomplete_shops > 0 {
            warn!(
                sender_id = %validated.scan.sender_id,
                dropped = validated.dropped_incomplete_shops,
                "Dropped incomplete shop observations"
            );
        }
        self.ingest_scan(
            &validated.scan,
            &validated.shops,
            &validated.waystones,
            validated.options,
        )
    }

    /// Recompute nearest-waystone annotations in their own transaction.
    pub fn recompute_nearest(&self, invalidation: &Invalidation) -> Result<usize> {
        self.conn
            .transaction(|tx| recompute_nearest(tx, invalidation))
    }

    /// Rebuild all shop and waystone state from the observation journal.
    pub fn rebuild_from_journal(&self) -> Result<RebuildReport> {
        ingest::rebuild_from_journal(&self.conn)
    }

    pub fn query_active_shops(&self, filter: &ShopFilter) -> Result<Vec<ShopState>> {
        query::query_active_shops(&self.conn, filter)
    }

    pub fn query_active_waystones(&self, filter: &WaystoneFilter) -> Result<Vec<WaystoneState>> {
        query::query_active_waystones(&self.conn, filter)
    }

    pub fn shop_history(&self, position: &Position) -> Result<Vec<ShopState>> {
        query::shop_history(&self.conn, position)
    }

    pub fn waystone_history(&self, position: &Position) -> Result<Vec<WaystoneState>> {
        query::waystone_history(&self.conn, position)
    }

    pub fn top_offers(&self, offer: &OfferQuery) -> Result<Vec<ShopState>> {
        query::top_offers(
            &self.conn,
            offer,
            self.config.default_offer_limit,
            self.config.max_offer_limit,
        )
    }

    pub fn offer_book(
        &self,
        item: &str,
        dimension: Option<Dimension>,
        limit: Option<usize>,
    ) -> Result<OfferBook> {
        query::offer_book(
            &self.conn,
            item,
            dimension,
            limit,
            self.config.default_offer_limit,
            self.config.max_offer_limit,
        )
    }

    pub fn list_items(&self) -> Result<Vec<String>> {
        query::list_items(&self.conn)
    }

    /// Chunk coverage as of `now`, paged by the configured chunk limits.
    pub fn chunk_summaries(&self, query: &ChunkQuery, now: DateTime<Utc>) -> Result<Vec<ChunkSummary>> {
        query::chunk_summaries(
            &self.conn,
            query,
            now,
            self.config.default_chunk_limit,
            self.config.max_chunk_limit,
        )
    }

    pub fn nearest_waystone(&self, position: &Position) -> Result<Option<NearestWaystone>> {
        query::nearest_waystone(&self.conn, position)
    }
}
