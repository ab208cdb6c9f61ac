//! Shop state reconciliation.
//!
//! Shops are reconciled chunk by chunk under the closed-world rule: a scan
//! covering a chunk lists every shop visible in it, so an active shop the
//! scan did not report is retired.

use crate::chunk::group_by_chunk;
use crate::error::Result;
use crate::merge::{plan_merge, ActiveVersion, Observation};
use crate::schema::{decode_action, decode_dimension, decode_time};
use crate::types::{
    ChunkCoord, ChunkKey, NearestWaystone, Position, ReconcileSummary, Scan, ScanId, ShopAction,
    ShopObservation, ShopState, ShopStateId, WaystoneStateId,
};
use std::collections::BTreeSet;
use tracing::debug;
use tradepost_db::{DbRow, DbTransaction, DbValue};

/// The fields whose change makes a new version.
#[derive(Debug, Clone, PartialEq)]
pub struct ShopFingerprint {
    pub owner: String,
    pub item: String,
    pub price: f64,
    pub amount: i64,
    pub action: ShopAction,
}

impl Observation for ShopObservation {
    type Fingerprint = ShopFingerprint;

    fn position(&self) -> &Position {
        &self.position
    }

    fn fingerprint(&self) -> Option<ShopFingerprint> {
        Some(ShopFingerprint {
            owner: self.owner.clone(),
            item: self.item.clone(),
            price: self.price,
            amount: self.amount,
            action: self.action,
        })
    }
}

/// What a shop pass changed.
#[derive(Debug, Default)]
pub struct ShopChanges {
    pub summary: ReconcileSummary,
    /// Positions whose active version was created or replaced.
    pub changed: BTreeSet<Position>,
    /// Positions left without an active version.
    pub pruned: BTreeSet<Position>,
}

const INSERT_COLUMNS: &[&str] = &[
    "id",
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
    "first_seen_at",
    "first_seen_scan_id",
    "last_seen_at",
    "last_seen_scan_id",
];

/// Select list for [`row_to_shop_state`]; joins the annotated waystone by id.
pub(crate) const SHOP_SELECT: &str = r#"
    SELECT s.id, s.dimension, s.pos_x, s.pos_y, s.pos_z, s.chunk_x, s.chunk_z,
           s.owner, s.item, s.price, s.amount, s.action,
           s.first_seen_at, s.first_seen_scan_id, s.last_seen_at, s.last_seen_scan_id,
           s.removed_at, s.nearest_waystone_id, s.nearest_waystone_distance_sq,
           w.name, w.owner, w.pos_x, w.pos_y, w.pos_z
    FROM shop_states s
    LEFT JOIN waystone_states w ON w.id = s.nearest_waystone_id
"#;

/// Reconcile one scan's shop observations.
///
/// Every chunk that received an observation is reconciled, plus the scan's
/// own chunk even when nothing was reported there. Without `closed_world`
/// unobserved shops are left active.
pub fn reconcile_shops(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    observations: &[ShopObservation],
    closed_world: bool,
) -> Result<ShopChanges> {
    let buckets = group_by_chunk(Some(scan.chunk_key()), observations.iter().cloned(), |obs| {
        obs.position.chunk()
    });

    let mut changes = ShopChanges::default();
    for (key, observed) in buckets {
        let active = load_active_in_chunk(tx, key)?;
        let plan = plan_merge(active, observed, closed_world)?;
        if plan.is_empty() {
            continue;
        }

        let mut chunk = ReconcileSummary {
            ignored: plan.ignored,
            ..ReconcileSummary::default()
        };
        let mut new_rows = Vec::with_capacity(plan.inserts.len() + plan.supersedes.len());
        for obs in plan.inserts {
            new_rows.push(version_row(tx, scan, &obs)?);
            changes.changed.insert(obs.position);
            chunk.inserted += 1;
        }
        for (id, obs) in plan.supersedes {
            retire(tx, id, scan)?;
            new_rows.push(version_row(tx, scan, &obs)?);
            changes.changed.insert(obs.position);
            chunk.superseded += 1;
        }
        for (id, _) in &plan.extends {
            extend(tx, *id, scan)?;
            chunk.extended += 1;
        }
        for (id, position) in plan.prunes {
            retire(tx, id, scan)?;
            changes.pruned.insert(position);
            chunk.pruned += 1;
        }
        tx.bulk_insert_rows("shop_states", INSERT_COLUMNS, &new_rows)?;

        debug!(
            scan_id = scan.id.as_i64(),
            chunk = %key,
            closed_world,
            inserted = chunk.inserted,
            extended = chunk.extended,
            superseded = chunk.superseded,
            pruned = chunk.pruned,
            "Reconciled shop chunk"
        );
        changes.summary.absorb(chunk);
    }

    Ok(changes)
}

fn load_active_in_chunk(
    tx: &mut DbTransaction<'_>,
    key: ChunkKey,
) -> Result<Vec<ActiveVersion<ShopStateId, ShopFingerprint>>> {
    let rows = tx.query_all(
        r#"
        SELECT id, pos_x, pos_y, pos_z, owner, item, price, amount, action
        FROM shop_states
        WHERE dimension = ? AND chunk_x = ? AND chunk_z = ? AND removed_at IS NULL
        ORDER BY id
        "#,
        &[
            key.dimension.as_str().into(),
            key.chunk.x.into(),
            key.chunk.z.into(),
        ],
    )?;

    rows.iter()
        .map(|row| {
            let action: String = row.get(8)?;
            Ok(ActiveVersion {
                id: ShopStateId::new(row.get(0)?),
                position: Position::new(key.dimension, row.get(1)?, row.get(2)?, row.get(3)?),
                fingerprint: ShopFingerprint {
                    owner: row.get(4)?,
                    item: row.get(5)?,
                    price: row.get(6)?,
                    amount: row.get(7)?,
                    action: decode_action(&action)?,
                },
                prunable: true,
            })
        })
        .collect()
}

fn version_row(
    tx: &mut DbTransaction<'_>,
    scan: &Scan,
    obs: &ShopObservation,
) -> Result<Vec<DbValue>> {
    let id = tx.next_sequence_value("seq_shop_states")?;
    let chunk = obs.position.chunk().chunk;
    let at = scan.scanned_at_millis();
    Ok(vec![
        id.into(),
        obs.position.dimension.as_str().into(),
        obs.position.x.into(),
        obs.position.y.into(),
        obs.position.z.into(),
        chunk.x.into(),
        chunk.z.into(),
        obs.owner.as_str().into(),
        obs.item.as_str().into(),
        obs.price.into(),
        obs.amount.into(),
        obs.action.as_str().into(),
        at.into(),
        scan.id.into(),
        at.into(),
        scan.id.into(),
    ])
}

fn extend(tx: &mut DbTransaction<'_>, id: ShopStateId, scan: &Scan) -> Result<()> {
    tx.execute(
        "UPDATE shop_states SET last_seen_at = ?, last_seen_scan_id = ? WHERE id = ?",
        &[scan.scanned_at_millis().into(), scan.id.into(), id.into()],
    )?;
    Ok(())
}

/// Mark a version historical. Only active versions carry an annotation.
fn retire(tx: &mut DbTransaction<'_>, id: ShopStateId, scan: &Scan) -> Result<()> {
    tx.execute(
        r#"
        UPDATE shop_states
        SET removed_at = ?, nearest_waystone_id = NULL, nearest_waystone_distance_sq = NULL
        WHERE id = ? AND removed_at IS NULL
        "#,
        &[scan.scanned_at_millis().into(), id.into()],
    )?;
    Ok(())
}

pub(crate) fn row_to_shop_state(row: &DbRow) -> Result<ShopState> {
    // 0:id 1:dimension 2-4:pos 5-6:chunk 7:owner 8:item 9:price 10:amount 11:action
    // 12:first_seen_at 13:first_seen_scan 14:last_seen_at 15:last_seen_scan 16:removed_at
    // 17:nearest_id 18:distance_sq 19:w.name 20:w.owner 21-23:w.pos
    let dimension_raw: String = row.get(1)?;
    let dimension = decode_dimension(&dimension_raw)?;
    let action_raw: String = row.get(11)?;
    let removed_at: Option<i64> = row.get(16)?;

    let nearest_id: Option<i64> = row.get(17)?;
    let nearest_waystone = match (nearest_id, row.get::<Option<String>>(19)?) {
        (Some(waystone_id), Some(name)) => Some(NearestWaystone {
            waystone_id: WaystoneStateId::new(waystone_id),
            name,
            owner: row.get(20)?,
            position: Position::new(dimension, row.get(21)?, row.get(22)?, row.get(23)?),
            distance_sq: row.get::<Option<i64>>(18)?.unwrap_or_default(),
        }),
        _ => None,
    };

    Ok(ShopState {
        id: ShopStateId::new(row.get(0)?),
        position: Position::new(dimension, row.get(2)?, row.get(3)?, row.get(4)?),
        chunk: ChunkCoord::new(row.get(5)?, row.get(6)?),
        owner: row.get(7)?,
        item: row.get(8)?,
        price: row.get(9)?,
        amount: row.get(10)?,
        action: decode_action(&action_raw)?,
        first_seen_at: decode_time(row.get(12)?),
        first_seen_scan: ScanId::new(row.get(13)?),
        last_seen_at: decode_time(row.get(14)?),
        last_seen_scan: ScanId::new(row.get(15)?),
        removed_at: removed_at.map(decode_time),
        nearest_waystone,
    })
}
