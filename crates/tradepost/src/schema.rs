//! Ledger schema (DuckDB).
//!
//! Timestamps are BIGINT milliseconds since the Unix epoch. Indexes cover
//! only columns that are never updated: positions, chunks and the scan
//! natural key. `last_seen_*`, `removed_at` and the nearest-waystone
//! annotation are updated in place.

use crate::error::{LedgerError, Result};
use crate::types::{Dimension, ShopAction, WaystoneSource};
use chrono::{DateTime, Utc};
use tradepost_db::{millis_to_datetime, DbConnection, DbValue};

/// Bump when the layout below changes incompatibly.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS seq_scans;
CREATE SEQUENCE IF NOT EXISTS seq_shop_states;
CREATE SEQUENCE IF NOT EXISTS seq_waystone_states;

CREATE TABLE IF NOT EXISTS tradepost_schema (
    version BIGINT NOT NULL
);

-- Scans: one row per ingest, never updated
CREATE TABLE IF NOT EXISTS scans (
    id BIGINT NOT NULL,
    sender_id TEXT NOT NULL,
    dimension TEXT NOT NULL,
    chunk_x INTEGER NOT NULL,
    chunk_z INTEGER NOT NULL,
    scanned_at BIGINT NOT NULL,
    skip_shop_reconcile BOOLEAN NOT NULL DEFAULT FALSE,
    skip_waystone_reconcile BOOLEAN NOT NULL DEFAULT FALSE
);

-- Observation journal: every accepted observation, in batch order
CREATE TABLE IF NOT EXISTS scan_shop_observations (
    scan_id BIGINT NOT NULL,
    ordinal INTEGER NOT NULL,
    dimension TEXT NOT NULL,
    pos_x INTEGER NOT NULL,
    pos_y INTEGER NOT NULL,
    pos_z INTEGER NOT NULL,
    chunk_x INTEGER NOT NULL,
    chunk_z INTEGER NOT NULL,
    owner TEXT NOT NULL,
    item TEXT NOT NULL,
    price DOUBLE NOT NULL,
    amount BIGINT NOT NULL,
    action TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scan_waystone_observations (
    scan_id BIGINT NOT NULL,
    ordinal INTEGER NOT NULL,
    dimension TEXT NOT NULL,
    pos_x INTEGER NOT NULL,
    pos_y INTEGER NOT NULL,
    pos_z INTEGER NOT NULL,
    chunk_x INTEGER NOT NULL,
    chunk_z INTEGER NOT NULL,
    source TEXT NOT NULL,
    name TEXT,
    owner TEXT
);

-- Shop versions: removed_at IS NULL marks the active one per position
CREATE TABLE IF NOT EXISTS shop_states (
    id BIGINT NOT NULL,
    dimension TEXT NOT NULL,
    pos_x INTEGER NOT NULL,
    pos_y INTEGER NOT NULL,
    pos_z INTEGER NOT NULL,
    chunk_x INTEGER NOT NULL,
    chunk_z INTEGER NOT NULL,
    owner TEXT NOT NULL,
    item TEXT NOT NULL,
    price DOUBLE NOT NULL,
    amount BIGINT NOT NULL,
    action TEXT NOT NULL,
    first_seen_at BIGINT NOT NULL,
    first_seen_scan_id BIGINT NOT NULL,
    last_seen_at BIGINT NOT NULL,
    last_seen_scan_id BIGINT NOT NULL,
    removed_at BIGINT,
    nearest_waystone_id BIGINT,
    nearest_waystone_distance_sq BIGINT
);

-- Waystone versions: same active-marker convention
CREATE TABLE IF NOT EXISTS waystone_states (
    id BIGINT NOT NULL,
    dimension TEXT NOT NULL,
    pos_x INTEGER NOT NULL,
    pos_y INTEGER NOT NULL,
    pos_z INTEGER NOT NULL,
    chunk_x INTEGER NOT NULL,
    chunk_z INTEGER NOT NULL,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    source TEXT NOT NULL,
    first_seen_at BIGINT NOT NULL,
    first_seen_scan_id BIGINT NOT NULL,
    last_seen_at BIGINT NOT NULL,
    last_seen_scan_id BIGINT NOT NULL,
    removed_at BIGINT
);

CREATE UNIQUE INDEX IF NOT EXISTS uniq_scans_natural_key
    ON scans(sender_id, dimension, chunk_x, chunk_z, scanned_at);
CREATE INDEX IF NOT EXISTS idx_scans_chunk ON scans(dimension, chunk_x, chunk_z);
CREATE INDEX IF NOT EXISTS idx_scan_shop_observations_scan ON scan_shop_observations(scan_id);
CREATE INDEX IF NOT EXISTS idx_scan_waystone_observations_scan ON scan_waystone_observations(scan_id);
CREATE INDEX IF NOT EXISTS idx_scan_shop_observations_chunk ON scan_shop_observations(dimension, chunk_x, chunk_z);
CREATE INDEX IF NOT EXISTS idx_scan_waystone_observations_chunk ON scan_waystone_observations(dimension, chunk_x, chunk_z);
CREATE INDEX IF NOT EXISTS idx_shop_states_position ON shop_states(dimension, pos_x, pos_y, pos_z);
CREATE INDEX IF NOT EXISTS idx_shop_states_chunk ON shop_states(dimension, chunk_x, chunk_z);
CREATE INDEX IF NOT EXISTS idx_waystone_states_position ON waystone_states(dimension, pos_x, pos_y, pos_z);
CREATE INDEX IF NOT EXISTS idx_waystone_states_chunk ON waystone_states(dimension, chunk_x, chunk_z);
"#;

const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "scans",
        &["id", "sender_id", "scanned_at", "skip_shop_reconcile", "skip_waystone_reconcile"],
    ),
    (
        "shop_states",
        &["removed_at", "nearest_waystone_id", "nearest_waystone_distance_sq"],
    ),
    ("waystone_states", &["name", "owner", "source", "removed_at"]),
    ("scan_shop_observations", &["ordinal", "chunk_x", "chunk_z"]),
    ("scan_waystone_observations", &["ordinal", "chunk_x", "chunk_z", "source"]),
];

/// Create the schema if missing and validate it.
pub fn ensure_schema(conn: &DbConnection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    let recorded: Option<i64> = conn
        .query_optional("SELECT version FROM tradepost_schema LIMIT 1", &[])?
        .map(|row| row.get(0))
        .transpose()?;
    if recorded.is_none() {
        conn.execute(
            "INSERT INTO tradepost_schema (version) VALUES (?)",
            &[SCHEMA_VERSION.into()],
        )?;
    }
    validate_schema(conn)
}

/// Fail loud if the database was written by an incompatible layout.
pub fn validate_schema(conn: &DbConnection) -> Result<()> {
    let version: Option<i64> = conn
        .query_optional("SELECT version FROM tradepost_schema LIMIT 1", &[])?
        .map(|row| row.get(0))
        .transpose()?;
    match version {
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(LedgerError::Config(format!(
                "Ledger schema version {} is not supported (expected {}). \
Rebuild the ledger with a matching tradepost release.",
                other, SCHEMA_VERSION
            )))
        }
        None => {
            return Err(LedgerError::Config(
                "Ledger schema is not initialized; open the ledger writable once to create it"
                    .to_string(),
            ))
        }
    }

    for (table, columns) in REQUIRED_COLUMNS {
        let mut missing = Vec::new();
        for column in *columns {
            if !column_exists(conn, table, column)? {
                missing.push(*column);
            }
        }
        if !missing.is_empty() {
            return Err(LedgerError::Config(format!(
                "Ledger table '{}' is missing columns: {}",
                table,
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

fn column_exists(conn: &DbConnection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_scalar(
        "SELECT COUNT(*) FROM information_schema.columns WHERE table_name = ? AND column_name = ?",
        &[DbValue::from(table), DbValue::from(column)],
    )?;
    Ok(count > 0)
}

pub(crate) fn decode_dimension(raw: &str) -> Result<Dimension> {
    Dimension::parse(raw).ok_or_else(|| {
        LedgerError::ConsistencyViolation(format!("Invalid dimension in storage: {}", raw))
    })
}

pub(crate) fn decode_action(raw: &str) -> Result<ShopAction> {
    ShopAction::parse(raw).ok_or_else(|| {
        LedgerError::ConsistencyViolation(format!("Invalid shop action in storage: {}", raw))
    })
}

pub(crate) fn decode_source(raw: &str) -> Result<WaystoneSource> {
    WaystoneSource::parse(raw).ok_or_else(|| {
        LedgerError::ConsistencyViolation(format!("Invalid waystone source in storage: {}", raw))
    })
}

pub(crate) fn decode_time(millis: i64) -> DateTime<Utc> {
    millis_to_datetime(millis)
}
