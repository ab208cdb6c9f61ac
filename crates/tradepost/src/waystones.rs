//! Waystone state reconciliation.
//!
//! Two sources feed the same versioning rule with different trust:
//!
//! - **ui** observations carry authoritative name and owner. They upsert by
//!   Position, may supersede the active version, and never prune anything.
//! - **chunk** sightings are passive. They confirm an existing record
//!   without touching its content, create one only when they happen to
//!   carry both name and owner, and prune chunk-sourced records their chunk
//!   no longer shows. Any ui observation in the batch switches that pruning
//!   off for the whole batch.

use crate::chunk::group_by_chunk;
use crate::error::Result;
use crate::merge::{last_per_position, plan_merge, ActiveVersion, MergePlan, Observation};
use crate::schema::{decode_dimension, decode_source, decode_time};
use crate::types::{
    ChunkCoord, ChunkKey, Dimension, Position, ReconcileSummary, Scan, ScanId,
    WaystoneObservation, WaystoneSource, WaystoneState, WaystoneStateId,
};
use std::collections::BTreeSet;
use tracing::debug;
use tradepost_db::{DbRow, DbTransaction, DbValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaystoneFingerprint {
    pub name: String,
    pub owner: String,
}

impl Observation for WaystoneObservation {
    type Fingerprint = WaystoneFingerprint;

    fn position(&self) -> &Position {
        WaystoneObservation::position(self)
    }

    fn fingerprint(&self) -> Option<WaystoneFingerprint> {
        match self {
            Self::Ui { name, owner, .. } => Some(WaystoneFingerprint {
                name: name.clone(),
                owner: owner.clone(),
            }),
            Self::Chunk {
                name: Some(name),
                owner: Some(owner),
                ..
            } if !name.trim().is_empty() && !owner.trim().is_empty() => Some(WaystoneFingerprint {
                name: name.clone(),
                owner: owner.clone(),
            }),
            Self::Chunk { .. } => None,
        }
    }

    fn may_supersede(&self) -> bool {
        matches!(self, Self::Ui { .. })
    }
}

/// What a waystone pass changed.
#[derive(Debug, Default)]
pub struct WaystoneChanges {
    pub summary: ReconcileSummary,
    /// Dimensions where an active waystone was created or replaced.
    pub changed_dimensions: BTreeSet<Dimension>,
    /// Versions retired without replacement.
    pub pruned: Vec<WaystoneStateId>,
}

const INSERT_COLUMNS: &[&str] = &[
    "id",
    "dimension",
    "pos_x",
    "pos_y",
    "pos_z",
    "chunk_x",
    "chunk_z",
    "name",
    "owner",
    "source",
    "first_seen_at",
    "first_seen_scan_id",
    "last_seen_at",
    "last_seen_scan_id",
];

pub(crate) const WAYSTONE_SELECT: &str = r#"
    SELECT id, dimension, pos_x, pos_y, pos_z, chunk_x, chunk_z, name, owner, source,
           first_seen_at, first_seen_scan_id, last_seen_at, last_seen_scan_id, removed_at
    FROM waystone_states
"#;

const ACTIVE_COLUMNS: &str = "id, pos_x, pos_y, pos_z, name, owner, source";

/// Reconcile one scan's waystone observations. ui first, then chunk sightings.
pub fn reconcile_waystones(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    observations: &[WaystoneObservation],
) -> Result<WaystoneChanges> {
    let (ui, sightings): (Vec<_>, Vec<_>) = observations
        .iter()
        .cloned()
        .partition(|obs| obs.source() == WaystoneSource::Ui);
    let closed_world = ui.is_empty();

    let mut changes = WaystoneChanges::default();

    if !ui.is_empty() {
        let ui = last_per_position(ui);
        let mut active = Vec::new();
        for obs in &ui {
            active.extend(load_active_at(tx, obs.position())?);
        }
        let plan = plan_merge(active, ui, false)?;
        let applied = apply_plan(tx, scan, plan, &mut changes)?;
        changes.summary.absorb(applied);
    }

    let buckets = group_by_chunk(Some(scan.chunk_key()), sightings, |obs| obs.position().chunk());
    for (key, observed) in buckets {
        let active = load_active_in_chunk(tx, key)?;
        let plan = plan_merge(active, observed, closed_world)?;
        let applied = apply_plan(tx, scan, plan, &mut changes)?;
        debug!(
            scan_id = scan.id.as_i64(),
            chunk = %key,
            closed_world,
            inserted = applied.inserted,
            extended = applied.extended,
            pruned = applied.pruned,
            "Reconciled waystone chunk"
        );
        changes.summary.absorb(applied);
    }

    Ok(changes)
}

/// Apply one plan and return its counts. Changed dimensions and pruned ids
/// are recorded in `changes`.
fn apply_plan(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    plan: MergePlan<WaystoneStateId, WaystoneObservation>,
    changes: &mut WaystoneChanges,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary {
        ignored: plan.ignored,
        ..ReconcileSummary::default()
    };

    let mut new_rows = Vec::with_capacity(plan.inserts.len() + plan.supersedes.len());
    for obs in plan.inserts {
        if let Some(row) = version_row(tx, scan, &obs)? {
            new_rows.push(row);
            changes.changed_dimensions.insert(obs.position().dimension);
            summary.inserted += 1;
        } else {
            summary.ignored += 1;
        }
    }
    for (id, obs) in plan.supersedes {
        if let Some(row) = version_row(tx, scan, &obs)? {
            retire(tx, id, scan)?;
            new_rows.push(row);
            changes.changed_dimensions.insert(obs.position().dimension);
            summary.superseded += 1;
        } else {
            extend(tx, id, scan, obs.source())?;
            summary.extended += 1;
        }
    }
    for (id, obs) in plan.extends {
        extend(tx, id, scan, obs.source())?;
        summary.extended += 1;
    }
    for (id, _) in plan.prunes {
        retire(tx, id, scan)?;
        changes.pruned.push(id);
        summary.pruned += 1;
    }
    tx.bulk_insert_rows("waystone_states", INSERT_COLUMNS, &new_rows)?;
    Ok(summary)
}

fn load_active_in_chunk(
    tx: &mut DbTransaction<'_>,
    key: ChunkKey,
) -> Result<Vec<ActiveVersion<WaystoneStateId, WaystoneFingerprint>>> {
    let rows = tx.query_all(
        &format!(
            "SELECT {ACTIVE_COLUMNS} FROM waystone_states \
             WHERE dimension = ? AND chunk_x = ? AND chunk_z = ? AND removed_at IS NULL ORDER BY id"
        ),
        &[
            key.dimension.as_str().into(),
            key.chunk.x.into(),
            key.chunk.z.into(),
        ],
    )?;
    rows.iter()
        .map(|row| active_version(row, key.dimension))
        .collect()
}

fn load_active_at(
    tx: &mut DbTransaction<'_>,
    position: &Position,
) -> Result<Vec<ActiveVersion<WaystoneStateId, WaystoneFingerprint>>> {
    let rows = tx.query_all(
        &format!(
            "SELECT {ACTIVE_COLUMNS} FROM waystone_states \
             WHERE dimension = ? AND pos_x = ? AND pos_y = ? AND pos_z = ? AND removed_at IS NULL ORDER BY id"
        ),
        &[
            position.dimension.as_str().into(),
            position.x.into(),
            position.y.into(),
            position.z.into(),
        ],
    )?;
    rows.iter()
        .map(|row| active_version(row, position.dimension))
        .collect()
}

fn active_version(
    row: &DbRow,
    dimension: Dimension,
) -> Result<ActiveVersion<WaystoneStateId, WaystoneFingerprint>> {
    let source: String = row.get(6)?;
    Ok(ActiveVersion {
        id: WaystoneStateId::new(row.get(0)?),
        position: Position::new(dimension, row.get(1)?, row.get(2)?, row.get(3)?),
        fingerprint: WaystoneFingerprint {
            name: row.get(4)?,
            owner: row.get(5)?,
        },
        prunable: decode_source(&source)? == WaystoneSource::Chunk,
    })
}

/// Row for a new version, or `None` for an observation that cannot found one.
fn version_row(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    obs: &WaystoneObservation,
) -> Result<Option<Vec<DbValue>>> {
    let Some(fingerprint) = obs.fingerprint() else {
        return Ok(None);
    };
    let id = tx.next_sequence_value("seq_waystone_states")?;
    let position = obs.position();
    let chunk = position.chunk().chunk;
    let at = scan.scanned_at_millis();
    Ok(Some(vec![
        id.into(),
        position.dimension.as_str().into(),
        position.x.into(),
        position.y.into(),
        position.z.into(),
        chunk.x.into(),
        chunk.z.into(),
        fingerprint.name.into(),
        fingerprint.owner.into(),
        obs.source().as_str().into(),
        at.into(),
        scan.id.into(),
        at.into(),
        scan.id.into(),
    ]))
}

/// Bump last-seen. A ui confirmation also adopts the version as ui-sourced,
/// which exempts it from chunk pruning; content is never changed here.
fn extend(
    tx: &mut DbTransaction<'_>,
    id: WaystoneStateId,
    scan: &Scan,
    source: WaystoneSource,
) -> Result<()> {
    let at = scan.scanned_at_millis();
    match source {
        WaystoneSource::Ui => tx.execute(
            "UPDATE waystone_states SET last_seen_at = ?, last_seen_scan_id = ?, source = ? WHERE id = ?",
            &[
                at.into(),
                scan.id.into(),
                WaystoneSource::Ui.as_str().into(),
                id.into(),
            ],
        )?,
        WaystoneSource::Chunk => tx.execute(
            "UPDATE waystone_states SET last_seen_at = ?, last_seen_scan_id = ? WHERE id = ?",
            &[at.into(), scan.id.into(), id.into()],
        )?,
    };
    Ok(())
}

fn retire(tx: &mut DbTransaction<'_>, id: WaystoneStateId, scan: &Scan) -> Result<()> {
    tx.execute(
        "UPDATE waystone_states SET removed_at = ? WHERE id = ? AND removed_at IS NULL",
        &[scan.scanned_at_millis().into(), id.into()],
    )?;
    Ok(())
}

pub(crate) fn row_to_waystone_state(row: &DbRow) -> Result<WaystoneState> {
    let dimension_raw: String = row.get(1)?;
    let dimension = decode_dimension(&dimension_raw)?;
    let source_raw: String = row.get(9)?;
    let removed_at: Option<i64> = row.get(14)?;

    Ok(WaystoneState {
        id: WaystoneStateId::new(row.get(0)?),
        position: Position::new(dimension, row.get(2)?, row.get(3)?, row.get(4)?),
        chunk: ChunkCoord::new(row.get(5)?, row.get(6)?),
        name: row.get(7)?,
        owner: row.get(8)?,
        source: decode_source(&source_raw)?,
        first_seen_at: decode_time(row.get(10)?),
        first_seen_scan: ScanId::new(row.get(11)?),
        last_seen_at: decode_time(row.get(12)?),
        last_seen_scan: ScanId::new(row.get(13)?),
        removed_at: removed_at.map(decode_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;
    use crate::types::IngestOptions;
    use chrono::{TimeZone, Utc};
    use tradepost_db::DbConnection;

    fn ledger() -> DbConnection {
        let conn = DbConnection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();
        conn
    }

    fn scan(id: i64) -> Scan {
        Scan {
            id: ScanId::new(id),
            sender_id: "tester".to_string(),
            dimension: Dimension::Overworld,
            chunk: ChunkCoord::new(0, 0),
            scanned_at: Utc.timestamp_millis_opt(1_000 * id).unwrap(),
            options: IngestOptions::default(),
        }
    }

    fn at(x: i32) -> Position {
        Position::new(Dimension::Overworld, x, 64, 0)
    }

    fn ui(x: i32, name: &str) -> WaystoneObservation {
        WaystoneObservation::Ui {
            position: at(x),
            name: name.to_string(),
            owner: "alice".to_string(),
        }
    }

    fn sighting(x: i32) -> WaystoneObservation {
        WaystoneObservation::Chunk {
            position: at(x),
            name: None,
            owner: None,
        }
    }

    fn named_sighting(x: i32, name: &str) -> WaystoneObservation {
        WaystoneObservation::Chunk {
            position: at(x),
            name: Some(name.to_string()),
            owner: Some("bob".to_string()),
        }
    }

    fn run(conn: &DbConnection, id: i64, obs: &[WaystoneObservation]) -> WaystoneChanges {
        conn.transaction(|tx| reconcile_waystones(tx, &scan(id), obs))
            .unwrap()
    }

    fn versions(conn: &DbConnection) -> Vec<WaystoneState> {
        conn.query_all(&format!("{WAYSTONE_SELECT} ORDER BY id"), &[])
            .unwrap()
            .iter()
            .map(|row| row_to_waystone_state(row).unwrap())
            .collect()
    }

    #[test]
    fn anonymous_sighting_never_creates() {
        let conn = ledger();
        let changes = run(&conn, 1, &[sighting(1)]);
        assert_eq!(changes.summary.ignored, 1);
        assert!(versions(&conn).is_empty());
    }

    #[test]
    fn named_sighting_creates_prunable_record() {
        let conn = ledger();
        let created = run(&conn, 1, &[named_sighting(1, "Market")]);
        assert_eq!(created.summary.inserted, 1);
        assert!(created.changed_dimensions.contains(&Dimension::Overworld));

        let pruned = run(&conn, 2, &[]);
        assert_eq!(pruned.summary.pruned, 1);
        assert!(!versions(&conn)[0].is_active());
    }

    #[test]
    fn sighting_extends_without_changing_content() {
        let conn = ledger();
        run(&conn, 1, &[ui(1, "Spawn")]);
        let changes = run(&conn, 2, &[named_sighting(1, "Renamed")]);
        assert_eq!(changes.summary.extended, 1);
        assert!(changes.changed_dimensions.is_empty());

        let all = versions(&conn);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Spawn");
        assert_eq!(all[0].last_seen_scan, ScanId::new(2));
    }

    #[test]
    fn ui_supersedes_and_is_immune_to_pruning() {
        let conn = ledger();
        run(&conn, 1, &[named_sighting(1, "Market")]);
        let renamed = run(&conn, 2, &[ui(1, "Bazaar")]);
        assert_eq!(renamed.summary.superseded, 1);

        let after_empty_scan = run(&conn, 3, &[]);
        assert_eq!(after_empty_scan.summary.pruned, 0);

        let all = versions(&conn);
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].name, "Bazaar");
        assert_eq!(all[1].source, WaystoneSource::Ui);
        assert!(all[1].is_active());
    }

    #[test]
    fn ui_in_batch_suppresses_chunk_pruning() {
        let conn = ledger();
        run(&conn, 1, &[named_sighting(1, "Market")]);
        let changes = run(&conn, 2, &[ui(5, "Spawn")]);
        assert_eq!(changes.summary.pruned, 0);
        assert_eq!(versions(&conn).iter().filter(|w| w.is_active()).count(), 2);
    }

    #[test]
    fn confirming_ui_changes_nothing_but_last_seen() {
        let conn = ledger();
        run(&conn, 1, &[ui(1, "Spawn")]);
        let changes = run(&conn, 2, &[ui(1, "Spawn")]);
        assert_eq!(changes.summary.extended, 1);
        assert!(changes.changed_dimensions.is_empty());
        assert!(changes.pruned.is_empty());
    }
}
