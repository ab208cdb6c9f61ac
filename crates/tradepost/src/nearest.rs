//! Nearest-waystone annotation cache.
//!
//! The annotation on an active shop references the closest active waystone
//! in its dimension by id. It is never journaled; callers name exactly
//! which shops to refresh through an [`Invalidation`].
//!
//! Tie-break: smallest squared distance, then the lowest waystone
//! Position (x, y, z), then the lowest id.

use crate::error::Result;
use crate::schema::decode_dimension;
use crate::types::{Dimension, Position, ShopStateId, WaystoneStateId};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;
use tradepost_db::{DbRow, DbTransaction, DbValue};

/// An active waystone as seen by the distance search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landmark {
    pub id: WaystoneStateId,
    pub position: Position,
}

/// Pick the closest landmark in `target`'s dimension.
pub fn select_nearest(target: &Position, candidates: &[Landmark]) -> Option<(Landmark, i64)> {
    candidates
        .iter()
        .filter(|c| c.position.dimension == target.dimension)
        .map(|c| (*c, target.distance_sq(&c.position)))
        .min_by(|(a, da), (b, db)| compare_candidates(a, *da, b, *db))
}

fn compare_candidates(a: &Landmark, da: i64, b: &Landmark, db: i64) -> Ordering {
    da.cmp(&db)
        .then_with(|| a.position.cmp(&b.position))
        .then_with(|| a.id.cmp(&b.id))
}

/// Which shop annotations must be recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    all: bool,
    dimensions: BTreeSet<Dimension>,
    positions: BTreeSet<Position>,
}

impl Invalidation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn everything() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    pub fn dimensions<I: IntoIterator<Item = Dimension>>(dimensions: I) -> Self {
        Self {
            dimensions: dimensions.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn add_dimension(&mut self, dimension: Dimension) {
        self.dimensions.insert(dimension);
    }

    pub fn add_position(&mut self, position: Position) {
        self.positions.insert(position);
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.dimensions.is_empty() && self.positions.is_empty()
    }

    fn covers_dimension(&self, dimension: Dimension) -> bool {
        self.all || self.dimensions.contains(&dimension)
    }

    fn positions_in(&self, dimension: Dimension) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(move |p| p.dimension == dimension)
    }
}

pub(crate) const LANDMARK_SQL: &str = r#"
    SELECT id, pos_x, pos_y, pos_z
    FROM waystone_states
    WHERE dimension = ? AND removed_at IS NULL
    ORDER BY id
"#;

pub(crate) fn row_to_landmark(row: &DbRow, dimension: Dimension) -> Result<Landmark> {
    Ok(Landmark {
        id: WaystoneStateId::new(row.get(0)?),
        position: Position::new(dimension, row.get(1)?, row.get(2)?, row.get(3)?),
    })
}

struct Target {
    id: ShopStateId,
    position: Position,
    current: Option<(i64, i64)>,
}

/// Recompute the annotations `invalidation` names. Returns the number of
/// active shops whose annotation was evaluated.
pub fn recompute_nearest(tx: &mut DbTransaction<'_>, invalidation: &Invalidation) -> Result<usize> {
    if invalidation.is_empty() {
        return Ok(0);
    }

    let mut evaluated = 0;
    for dimension in Dimension::ALL {
        let targets = if invalidation.covers_dimension(dimension) {
            load_targets_in_dimension(tx, dimension)?
        } else {
            let mut targets = Vec::new();
            for position in invalidation.positions_in(dimension) {
                targets.extend(load_target_at(tx, position)?);
            }
            targets
        };
        if targets.is_empty() {
            continue;
        }

        let landmarks = tx
            .query_all(LANDMARK_SQL, &[dimension.as_str().into()])?
            .iter()
            .map(|row| row_to_landmark(row, dimension))
            .collect::<Result<Vec<_>>>()?;

        let mut written = 0;
        for target in &targets {
            let next = select_nearest(&target.position, &landmarks)
                .map(|(landmark, distance_sq)| (landmark.id.as_i64(), distance_sq));
            if next == target.current {
                continue;
            }
            tx.execute(
                "UPDATE shop_states SET nearest_waystone_id = ?, nearest_waystone_distance_sq = ? WHERE id = ?",
                &[
                    DbValue::from(next.map(|(id, _)| id)),
                    DbValue::from(next.map(|(_, d)| d)),
                    target.id.as_i64().into(),
                ],
            )?;
            written += 1;
        }
        evaluated += targets.len();

        debug!(
            dimension = %dimension,
            shops = targets.len(),
            waystones = landmarks.len(),
            written,
            "Recomputed nearest waystones"
        );
    }
    Ok(evaluated)
}

const TARGET_COLUMNS: &str =
    "id, dimension, pos_x, pos_y, pos_z, nearest_waystone_id, nearest_waystone_distance_sq";

fn load_targets_in_dimension(tx: &mut DbTransaction<'_>, dimension: Dimension) -> Result<Vec<Target>> {
    tx.query_all(
        &format!(
            "SELECT {TARGET_COLUMNS} FROM shop_states \
             WHERE dimension = ? AND removed_at IS NULL ORDER BY id"
        ),
        &[dimension.as_str().into()],
    )?
    .iter()
    .map(row_to_target)
    .collect()
}

fn load_target_at(tx: &mut DbTransaction<'_>, position: &Position) -> Result<Vec<Target>> {
    tx.query_all(
        &format!(
            "SELECT {TARGET_COLUMNS} FROM shop_states \
             WHERE dimension = ? AND pos_x = ? AND pos_y = ? AND pos_z = ? AND removed_at IS NULL"
        ),
        &[
            position.dimension.as_str().into(),
            position.x.into(),
            position.y.into(),
            position.z.into(),
        ],
    )?
    .iter()
    .map(row_to_target)
    .collect()
}

fn row_to_target(row: &DbRow) -> Result<Target> {
    let dimension_raw: String = row.get(1)?;
    let dimension = decode_dimension(&dimension_raw)?;
    let nearest_id: Option<i64> = row.get(5)?;
    let distance_sq: Option<i64> = row.get(6)?;
    Ok(Target {
        id: ShopStateId::new(row.get(0)?),
        position: Position::new(dimension, row.get(2)?, row.get(3)?, row.get(4)?),
        current: nearest_id.zip(distance_sq),
    })
}

/// Positions of active shops whose annotation references one of `waystones`.
pub fn shops_annotated_with(
    tx: &mut DbTransaction<'_>,
    waystones: &[WaystoneStateId],
) -> Result<BTreeSet<Position>> {
    let mut positions = BTreeSet::new();
    for id in waystones {
        let rows = tx.query_all(
            "SELECT dimension, pos_x, pos_y, pos_z FROM shop_states \
             WHERE nearest_waystone_id = ? AND removed_at IS NULL",
            &[(*id).into()],
        )?;
        for row in &rows {
            let dimension_raw: String = row.get(0)?;
            positions.insert(Position::new(
                decode_dimension(&dimension_raw)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            ));
        }
    }
    Ok(positions)
}
