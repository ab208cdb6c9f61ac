//! Scan ingest orchestration and journal replay.
//!
//! One scan is one transaction: record the scan, journal its observations,
//! reconcile shops, reconcile waystones, refresh the annotations the
//! changes invalidated, commit. Any error rolls the whole scan back.

use crate::error::{LedgerError, Result};
use crate::nearest::{recompute_nearest, shops_annotated_with, Invalidation};
use crate::schema::{decode_action, decode_dimension, decode_source, decode_time};
use crate::shops::reconcile_shops;
use crate::types::{
    ChunkCoord, IngestOptions, IngestReport, NewScan, Position, RebuildReport, ReconcileSummary,
    Scan, ScanId, ShopObservation, WaystoneObservation, WaystoneSource,
};
use crate::waystones::reconcile_waystones;
use tracing::{info, warn};
use tradepost_db::{DbConnection, DbRow, DbTransaction, DbValue};

const SCAN_COLUMNS: &[&str] = &[
    "id",
    "sender_id",
    "dimension",
    "chunk_x",
    "chunk_z",
    "scanned_at",
    "skip_shop_reconcile",
    "skip_waystone_reconcile",
];

const SHOP_JOURNAL_COLUMNS: &[&str] = &[
    "scan_id",
    "ordinal",
    "dimension",
    "pos_x",
    "pos_y",
    "pos_z",
    "chunk_x",
    "chunk_z",
    "owner",
    "item",
    "price",
    "amount",
    "action",
];

const WAYSTONE_JOURNAL_COLUMNS: &[&str] = &[
    "scan_id",
    "ordinal",
    "dimension",
    "pos_x",
    "pos_y",
    "pos_z",
    "chunk_x",
    "chunk_z",
    "source",
    "name",
    "owner",
];

/// Ingest one scan atomically.
///
/// A scan whose natural key (sender, dimension, chunk, timestamp) is
/// already recorded fails with [`LedgerError::DuplicateScan`] and writes
/// nothing.
pub fn ingest_scan(
    conn: &DbConnection,
    scan: &NewScan,
    shops: &[ShopObservation],
    waystones: &[WaystoneObservation],
    options: IngestOptions,
) -> Result<IngestReport> {
    let result: Result<IngestReport> = conn.transaction(|tx| {
        let scan = record_scan(tx, scan, options)?;
        journal_observations(tx, scan.id, shops, waystones)?;
        let (shop_summary, waystone_summary, invalidation) =
            apply_scan(tx, &scan, shops, waystones, Annotations::Track)?;
        let annotations_recomputed = recompute_nearest(tx, &invalidation)?;
        Ok(IngestReport {
            scan_id: scan.id,
            shops: shop_summary,
            waystones: waystone_summary,
            annotations_recomputed,
        })
    });

    match &result {
        Ok(report) => info!(
            scan_id = report.scan_id.as_i64(),
            sender_id = %scan.sender_id,
            dimension = %scan.dimension,
            chunk_x = scan.chunk.x,
            chunk_z = scan.chunk.z,
            shops_inserted = report.shops.inserted,
            shops_extended = report.shops.extended,
            shops_superseded = report.shops.superseded,
            shops_pruned = report.shops.pruned,
            waystones_inserted = report.waystones.inserted,
            waystones_extended = report.waystones.extended,
            waystones_superseded = report.waystones.superseded,
            waystones_pruned = report.waystones.pruned,
            annotations = report.annotations_recomputed,
            "Scan ingested"
        ),
        Err(err) if err.is_duplicate() => warn!(
            sender_id = %scan.sender_id,
            dimension = %scan.dimension,
            chunk_x = scan.chunk.x,
            chunk_z = scan.chunk.z,
            "Duplicate scan ignored"
        ),
        Err(_) => {}
    }
    result
}

fn record_scan(tx: &mut DbTransaction<'_>, new: &NewScan, options: IngestOptions) -> Result<Scan> {
    let scanned_at = new.scanned_at.timestamp_millis();
    let existing = tx.query_optional(
        "SELECT id FROM scans \
         WHERE sender_id = ? AND dimension = ? AND chunk_x = ? AND chunk_z = ? AND scanned_at = ?",
        &[
            new.sender_id.as_str().into(),
            new.dimension.as_str().into(),
            new.chunk.x.into(),
            new.chunk.z.into(),
            scanned_at.into(),
        ],
    )?;
    if existing.is_some() {
        return Err(LedgerError::DuplicateScan {
            sender_id: new.sender_id.clone(),
            dimension: new.dimension,
            chunk_x: new.chunk.x,
            chunk_z: new.chunk.z,
            scanned_at,
        });
    }

    let id = ScanId::new(tx.next_sequence_value("seq_scans")?);
    tx.bulk_insert_rows(
        "scans",
        SCAN_COLUMNS,
        &[vec![
            id.into(),
            new.sender_id.as_str().into(),
            new.dimension.as_str().into(),
            new.chunk.x.into(),
            new.chunk.z.into(),
            scanned_at.into(),
            options.skip_shop_reconcile.into(),
            options.skip_waystone_reconcile.into(),
        ]],
    )?;

    Ok(Scan {
        id,
        sender_id: new.sender_id.clone(),
        dimension: new.dimension,
        chunk: new.chunk,
        scanned_at: decode_time(scanned_at),
        options,
    })
}

fn journal_observations(
    tx: &mut DbTransaction<'_>,
    scan_id: ScanId,
    shops: &[ShopObservation],
    waystones: &[WaystoneObservation],
) -> Result<()> {
    let shop_rows: Vec<Vec<DbValue>> = shops
        .iter()
        .enumerate()
        .map(|(ordinal, shop)| {
            let chunk = shop.position.chunk().chunk;
            vec![
                scan_id.into(),
                (ordinal as i64).into(),
                shop.position.dimension.as_str().into(),
                shop.position.x.into(),
                shop.position.y.into(),
                shop.position.z.into(),
                chunk.x.into(),
                chunk.z.into(),
                shop.owner.as_str().into(),
                shop.item.as_str().into(),
                shop.price.into(),
                shop.amount.into(),
                shop.action.as_str().into(),
            ]
        })
        .collect();
    tx.bulk_insert_rows("scan_shop_observations", SHOP_JOURNAL_COLUMNS, &shop_rows)?;

    let waystone_rows: Vec<Vec<DbValue>> = waystones
        .iter()
        .enumerate()
        .map(|(ordinal, waystone)| {
            let position = waystone.position();
            let chunk = position.chunk().chunk;
            vec![
                scan_id.into(),
                (ordinal as i64).into(),
                position.dimension.as_str().into(),
                position.x.into(),
                position.y.into(),
                position.z.into(),
                chunk.x.into(),
                chunk.z.into(),
                waystone.source().as_str().into(),
                waystone.name().into(),
                waystone.owner().into(),
            ]
        })
        .collect();
    tx.bulk_insert_rows(
        "scan_waystone_observations",
        WAYSTONE_JOURNAL_COLUMNS,
        &waystone_rows,
    )?;
    Ok(())
}

/// Whether `apply_scan` tracks annotation invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Annotations {
    /// Live ingest: collect what the reconcilers invalidated.
    Track,
    /// Journal replay: everything is recomputed once at the end.
    Deferred,
}

/// Run both reconcilers for a recorded scan and collect what they invalidated.
///
/// A batch carrying any ui waystone is out-of-band and prunes nothing.
fn apply_scan(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    shops: &[ShopObservation],
    waystones: &[WaystoneObservation],
    annotations: Annotations,
) -> Result<(ReconcileSummary, ReconcileSummary, Invalidation)> {
    let mut invalidation = Invalidation::none();
    let ui_push = waystones
        .iter()
        .any(|obs| obs.source() == WaystoneSource::Ui);

    let mut shop_summary = ReconcileSummary::default();
    if !scan.options.skip_shop_reconcile {
        let changes = reconcile_shops(tx, scan, shops, !ui_push)?;
        for position in changes.changed {
            invalidation.add_position(position);
        }
        shop_summary = changes.summary;
    }

    let mut waystone_summary = ReconcileSummary::default();
    if !scan.options.skip_waystone_reconcile {
        let changes = reconcile_waystones(tx, scan, waystones)?;
        for dimension in changes.changed_dimensions {
            invalidation.add_dimension(dimension);
        }
        if annotations == Annotations::Track {
            for position in shops_annotated_with(tx, &changes.pruned)? {
                invalidation.add_position(position);
            }
        }
        waystone_summary = changes.summary;
    }

    Ok((shop_summary, waystone_summary, invalidation))
}

/// Rebuild shop and waystone state by replaying the observation journal.
///
/// Runs in one transaction; annotations are recomputed once at the end.
pub fn rebuild_from_journal(conn: &DbConnection) -> Result<RebuildReport> {
    let report = conn.transaction(|tx| {
        tx.execute("DELETE FROM shop_states", &[])?;
        tx.execute("DELETE FROM waystone_states", &[])?;

        let scans = tx
            .query_all(
                "SELECT id, sender_id, dimension, chunk_x, chunk_z, scanned_at, \
                        skip_shop_reconcile, skip_waystone_reconcile \
                 FROM scans ORDER BY scanned_at, id",
                &[],
            )?
            .iter()
            .map(row_to_scan)
            .collect::<Result<Vec<_>>>()?;

        let mut report = RebuildReport::default();
        for scan in &scans {
            let shops = load_shop_journal(tx, scan.id)?;
            let waystones = load_waystone_journal(tx, scan.id)?;
            apply_scan(tx, scan, &shops, &waystones, Annotations::Deferred)?;
            report.scans_replayed += 1;
            report.shop_observations += shops.len();
            report.waystone_observations += waystones.len();
        }

        recompute_nearest(tx, &Invalidation::everything())?;

        let active_shops: i64 =
            tx.query_scalar("SELECT COUNT(*) FROM shop_states WHERE removed_at IS NULL", &[])?;
        let active_waystones: i64 = tx.query_scalar(
            "SELECT COUNT(*) FROM waystone_states WHERE removed_at IS NULL",
            &[],
        )?;
        report.active_shops = count(active_shops, "active shops")?;
        report.active_waystones = count(active_waystones, "active waystones")?;
        Ok::<_, LedgerError>(report)
    })?;

    info!(
        scans = report.scans_replayed,
        shop_observations = report.shop_observations,
        waystone_observations = report.waystone_observations,
        active_shops = report.active_shops,
        active_waystones = report.active_waystones,
        "Rebuilt ledger from journal"
    );
    Ok(report)
}

fn count(value: i64, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| LedgerError::ConsistencyViolation(format!("Invalid count of {what}: {value}")))
}

pub(crate) fn row_to_scan(row: &DbRow) -> Result<Scan> {
    let dimension_raw: String = row.get(2)?;
    Ok(Scan {
        id: ScanId::new(row.get(0)?),
        sender_id: row.get(1)?,
        dimension: decode_dimension(&dimension_raw)?,
        chunk: ChunkCoord::new(row.get(3)?, row.get(4)?),
        scanned_at: decode_time(row.get(5)?),
        options: IngestOptions {
            skip_shop_reconcile: row.get(6)?,
            skip_waystone_reconcile: row.get(7)?,
        },
    })
}

fn load_shop_journal(tx: &mut DbTransaction<'_>, scan_id: ScanId) -> Result<Vec<ShopObservation>> {
    tx.query_all(
        "SELECT dimension, pos_x, pos_y, pos_z, owner, item, price, amount, action \
         FROM scan_shop_observations WHERE scan_id = ? ORDER BY ordinal",
        &[scan_id.into()],
    )?
    .iter()
    .map(|row| {
        let dimension_raw: String = row.get(0)?;
        let action_raw: String = row.get(8)?;
        Ok(ShopObservation {
            position: Position::new(
                decode_dimension(&dimension_raw)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            ),
            owner: row.get(4)?,
            item: row.get(5)?,
            price: row.get(6)?,
            amount: row.get(7)?,
            action: decode_action(&action_raw)?,
        })
    })
    .collect()
}

fn load_waystone_journal(
    tx: &mut DbTransaction<'_>,
    scan_id: ScanId,
) -> Result<Vec<WaystoneObservation>> {
    tx.query_all(
        "SELECT dimension, pos_x, pos_y, pos_z, source, name, owner \
         FROM scan_waystone_observations WHERE scan_id = ? ORDER BY ordinal",
        &[scan_id.into()],
    )?
    .iter()
    .map(|row| {
        let dimension_raw: String = row.get(0)?;
        let source_raw: String = row.get(4)?;
        let position = Position::new(
            decode_dimension(&dimension_raw)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
        );
        let name: Option<String> = row.get(5)?;
        let owner: Option<String> = row.get(6)?;
        match decode_source(&source_raw)? {
            WaystoneSource::Ui => match (name, owner) {
                (Some(name), Some(owner)) => Ok(WaystoneObservation::Ui {
                    position,
                    name,
                    owner,
                }),
                _ => Err(LedgerError::ConsistencyViolation(format!(
                    "Journaled ui waystone at {} in {} lacks name or owner",
                    position, scan_id
                ))),
            },
            WaystoneSource::Chunk => Ok(WaystoneObservation::Chunk {
                position,
                name,
                owner,
            }),
        }
    })
    .collect()
}
