//! Read-side projections over the ledger.
//!
//! Everything here reads committed state only and works on read-only
//! connections.

use crate::error::{LedgerError, Result};
use crate::nearest::{select_nearest, Landmark};
use crate::schema::{decode_dimension, decode_time};
use crate::shops::{row_to_shop_state, SHOP_SELECT};
use crate::types::{
    ChunkCoord, Dimension, NearestWaystone, Position, ShopAction, ShopState, WaystoneSource,
    WaystoneState,
};
use crate::waystones::{row_to_waystone_state, WAYSTONE_SELECT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tradepost_db::{DbConnection, DbValue};

/// Filter for [`query_active_shops`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShopFilter {
    pub dimension: Option<Dimension>,
    /// Case-insensitive.
    pub item: Option<String>,
    pub action: Option<ShopAction>,
    /// Case-insensitive.
    pub owner: Option<String>,
    pub chunk: Option<ChunkCoord>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaystoneFilter {
    pub dimension: Option<Dimension>,
    pub source: Option<WaystoneSource>,
    pub chunk: Option<ChunkCoord>,
    pub limit: Option<usize>,
}

/// Accumulates `AND`-joined predicates and their parameters.
#[derive(Default)]
struct Predicates {
    clauses: Vec<String>,
    params: Vec<DbValue>,
}

impl Predicates {
    fn push(&mut self, clause: &str, params: Vec<DbValue>) {
        self.clauses.push(clause.to_string());
        self.params.extend(params);
    }

    fn chunk(&mut self, alias: &str, chunk: Option<ChunkCoord>) {
        if let Some(chunk) = chunk {
            self.push(
                &format!("{alias}.chunk_x = ? AND {alias}.chunk_z = ?"),
                vec![chunk.x.into(), chunk.z.into()],
            );
        }
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default()
}

/// Active shops matching `filter`, ordered by Position.
pub fn query_active_shops(conn: &DbConnection, filter: &ShopFilter) -> Result<Vec<ShopState>> {
    let mut predicates = Predicates::default();
    predicates.push("s.removed_at IS NULL", Vec::new());
    if let Some(dimension) = filter.dimension {
        predicates.push("s.dimension = ?", vec![dimension.as_str().into()]);
    }
    if let Some(item) = &filter.item {
        predicates.push("lower(s.item) = lower(?)", vec![item.as_str().into()]);
    }
    if let Some(action) = filter.action {
        predicates.push("s.action = ?", vec![action.as_str().into()]);
    }
    if let Some(owner) = &filter.owner {
        predicates.push("lower(s.owner) = lower(?)", vec![owner.as_str().into()]);
    }
    predicates.chunk("s", filter.chunk);

    let sql = format!(
        "{SHOP_SELECT}{} ORDER BY s.dimension, s.pos_x, s.pos_y, s.pos_z{}",
        predicates.where_clause(),
        limit_clause(filter.limit)
    );
    conn.query_all(&sql, &predicates.params)?
        .iter()
        .map(row_to_shop_state)
        .collect()
}

/// Active waystones matching `filter`, ordered by Position.
pub fn query_active_waystones(
    conn: &DbConnection,
    filter: &WaystoneFilter,
) -> Result<Vec<WaystoneState>> {
    let mut predicates = Predicates::default();
    predicates.push("w.removed_at IS NULL", Vec::new());
    if let Some(dimension) = filter.dimension {
        predicates.push("w.dimension = ?", vec![dimension.as_str().into()]);
    }
    if let Some(source) = filter.source {
        predicates.push("w.source = ?", vec![source.as_str().into()]);
    }
    predicates.chunk("w", filter.chunk);

    let sql = format!(
        "SELECT * FROM ({WAYSTONE_SELECT}) w{} ORDER BY w.dimension, w.pos_x, w.pos_y, w.pos_z{}",
        predicates.where_clause(),
        limit_clause(filter.limit)
    );
    conn.query_all(&sql, &predicates.params)?
        .iter()
        .map(row_to_waystone_state)
        .collect()
}

fn position_params(position: &Position) -> [DbValue; 4] {
    [
        position.dimension.as_str().into(),
        position.x.into(),
        position.y.into(),
        position.z.into(),
    ]
}

/// Every shop version at `position`, oldest first.
pub fn shop_history(conn: &DbConnection, position: &Position) -> Result<Vec<ShopState>> {
    let sql = format!(
        "{SHOP_SELECT} WHERE s.dimension = ? AND s.pos_x = ? AND s.pos_y = ? AND s.pos_z = ? \
         ORDER BY s.first_seen_at, s.id"
    );
    conn.query_all(&sql, &position_params(position))?
        .iter()
        .map(row_to_shop_state)
        .collect()
}

/// Every waystone version at `position`, oldest first.
pub fn waystone_history(conn: &DbConnection, position: &Position) -> Result<Vec<WaystoneState>> {
    let sql = format!(
        "{WAYSTONE_SELECT} WHERE dimension = ? AND pos_x = ? AND pos_y = ? AND pos_z = ? \
         ORDER BY first_seen_at, id"
    );
    conn.query_all(&sql, &position_params(position))?
        .iter()
        .map(row_to_waystone_state)
        .collect()
}

/// Best offers for one item and side of the market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferQuery {
    pub item: String,
    pub action: ShopAction,
    #[serde(default)]
    pub dimension: Option<Dimension>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Both sides of the market for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferBook {
    pub item: String,
    /// Most recent `last_seen_at` among the listed offers.
    pub refreshed_at: Option<DateTime<Utc>>,
    pub sellers: Vec<ShopState>,
    pub buyers: Vec<ShopState>,
}

/// Cheapest sellers or highest-paying buyers for an item.
///
/// One row per (owner, price), keeping the most recently seen shop.
/// `limit` falls back to `default_limit` and is capped at `max_limit`.
pub fn top_offers(
    conn: &DbConnection,
    query: &OfferQuery,
    default_limit: usize,
    max_limit: usize,
) -> Result<Vec<ShopState>> {
    let item = query.item.trim();
    if item.is_empty() {
        return Err(LedgerError::Validation("Offer query needs an item".to_string()));
    }
    let price_order = match query.action {
        ShopAction::Sell => "ASC",
        ShopAction::Buy => "DESC",
        ShopAction::OutOfStock => {
            return Err(LedgerError::Validation(
                "Offers are listed for sell or buy shops only".to_string(),
            ))
        }
    };
    let limit = query.limit.unwrap_or(default_limit).clamp(1, max_limit.max(1));

    let mut params: Vec<DbValue> = vec![item.into(), query.action.as_str().into()];
    let dimension_clause = match query.dimension {
        Some(dimension) => {
            params.push(dimension.as_str().into());
            " AND dimension = ?"
        }
        None => "",
    };

    let sql = format!(
        r#"{SHOP_SELECT}
        WHERE s.id IN (
            SELECT id FROM (
                SELECT id, ROW_NUMBER() OVER (
                    PARTITION BY owner, price
                    ORDER BY last_seen_at DESC, dimension, pos_x, pos_y, pos_z
                ) AS rn
                FROM shop_states
                WHERE removed_at IS NULL AND lower(item) = lower(?) AND action = ?{dimension_clause}
            ) WHERE rn = 1
        )
        ORDER BY s.price {price_order}, s.last_seen_at DESC, s.dimension, s.pos_x, s.pos_y, s.pos_z
        LIMIT {limit}"#
    );
    conn.query_all(&sql, &params)?
        .iter()
        .map(row_to_shop_state)
        .collect()
}

/// Sellers and buyers for `item` in one call.
pub fn offer_book(
    conn: &DbConnection,
    item: &str,
    dimension: Option<Dimension>,
    limit: Option<usize>,
    default_limit: usize,
    max_limit: usize,
) -> Result<OfferBook> {
    let side = |action| OfferQuery {
        item: item.to_string(),
        action,
        dimension,
        limit,
    };
    let sellers = top_offers(conn, &side(ShopAction::Sell), default_limit, max_limit)?;
    let buyers = top_offers(conn, &side(ShopAction::Buy), default_limit, max_limit)?;
    let refreshed_at = sellers
        .iter()
        .chain(buyers.iter())
        .map(|shop| shop.last_seen_at)
        .max();
    Ok(OfferBook {
        item: item.trim().to_string(),
        refreshed_at,
        sellers,
        buyers,
    })
}

/// Distinct item names among active shops, case-insensitive order.
pub fn list_items(conn: &DbConnection) -> Result<Vec<String>> {
    conn.query_all(
        "SELECT item FROM shop_states WHERE removed_at IS NULL GROUP BY item ORDER BY lower(item), item",
        &[],
    )?
    .iter()
    .map(|row| row.get::<String>(0).map_err(LedgerError::from))
    .collect()
}

/// Per-chunk coverage and population.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSummary {
    pub dimension: Dimension,
    pub chunk: ChunkCoord,
    pub total_scans: i64,
    pub latest_scanned_at: Option<DateTime<Utc>>,
    pub minutes_since_last_scan: Option<i64>,
    pub active_shops: i64,
    pub active_waystones: i64,
    /// Shop rows journaled by the chunk's latest scan.
    pub last_observed_shops: i64,
    /// Waystone rows journaled by the latest scan, at least the active count.
    pub last_observed_waystones: i64,
    /// Distinct (owner, item, position) ever journaled in the chunk.
    pub ever_observed_shops: i64,
    /// Distinct positions ever journaled in the chunk, sightings included.
    pub ever_observed_waystones: i64,
}

/// Filter and paging for [`chunk_summaries`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkQuery {
    pub dimension: Option<Dimension>,
    /// Drop chunks scanned less than this many minutes ago.
    pub stale_minutes: Option<i64>,
    pub min_ever: Option<i64>,
    pub min_ever_waystones: Option<i64>,
    pub has_waystones: Option<bool>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ChunkQuery {
    fn matches(&self, chunk: &ChunkSummary) -> bool {
        if let (Some(stale), Some(minutes)) = (self.stale_minutes, chunk.minutes_since_last_scan) {
            if minutes < stale {
                return false;
            }
        }
        if self.min_ever.is_some_and(|min| chunk.ever_observed_shops < min) {
            return false;
        }
        if self
            .min_ever_waystones
            .is_some_and(|min| chunk.ever_observed_waystones < min)
        {
            return false;
        }
        match self.has_waystones {
            Some(wanted) => (chunk.ever_observed_waystones > 0) == wanted,
            None => true,
        }
    }
}

const CHUNK_SUMMARY_SQL: &str = r#"
    WITH keys AS (
        SELECT dimension, chunk_x, chunk_z FROM scans
        UNION
        SELECT dimension, chunk_x, chunk_z FROM waystone_states WHERE removed_at IS NULL
    ),
    scan_stats AS (
        SELECT dimension, chunk_x, chunk_z, COUNT(*) AS total, MAX(scanned_at) AS latest
        FROM scans GROUP BY dimension, chunk_x, chunk_z
    ),
    latest_scan AS (
        SELECT dimension, chunk_x, chunk_z, id FROM (
            SELECT dimension, chunk_x, chunk_z, id, ROW_NUMBER() OVER (
                PARTITION BY dimension, chunk_x, chunk_z ORDER BY scanned_at DESC, id DESC
            ) AS rn
            FROM scans
        ) WHERE rn = 1
    ),
    scan_shops AS (
        SELECT scan_id, COUNT(*) AS n FROM scan_shop_observations GROUP BY scan_id
    ),
    scan_waystones AS (
        SELECT scan_id, COUNT(*) AS n FROM scan_waystone_observations GROUP BY scan_id
    ),
    active_shops AS (
        SELECT dimension, chunk_x, chunk_z, COUNT(*) AS n
        FROM shop_states WHERE removed_at IS NULL GROUP BY dimension, chunk_x, chunk_z
    ),
    active_waystones AS (
        SELECT dimension, chunk_x, chunk_z, COUNT(*) AS n
        FROM waystone_states WHERE removed_at IS NULL GROUP BY dimension, chunk_x, chunk_z
    ),
    ever_shops AS (
        SELECT dimension, chunk_x, chunk_z, COUNT(*) AS n FROM (
            SELECT DISTINCT dimension, chunk_x, chunk_z, owner, item, pos_x, pos_y, pos_z
            FROM scan_shop_observations
        ) GROUP BY dimension, chunk_x, chunk_z
    ),
    ever_waystones AS (
        SELECT dimension, chunk_x, chunk_z, COUNT(*) AS n FROM (
            SELECT DISTINCT dimension, chunk_x, chunk_z, pos_x, pos_y, pos_z
            FROM scan_waystone_observations
        ) GROUP BY dimension, chunk_x, chunk_z
    )
    SELECT k.dimension, k.chunk_x, k.chunk_z,
           COALESCE(sc.total, 0), sc.latest,
           COALESCE(ash.n, 0), COALESCE(aws.n, 0),
           COALESCE(lsh.n, 0), COALESCE(lws.n, 0),
           COALESCE(esh.n, 0), COALESCE(ews.n, 0)
    FROM keys k
    LEFT JOIN scan_stats sc
        ON sc.dimension = k.dimension AND sc.chunk_x = k.chunk_x AND sc.chunk_z = k.chunk_z
    LEFT JOIN latest_scan ls
        ON ls.dimension = k.dimension AND ls.chunk_x = k.chunk_x AND ls.chunk_z = k.chunk_z
    LEFT JOIN scan_shops lsh ON lsh.scan_id = ls.id
    LEFT JOIN scan_waystones lws ON lws.scan_id = ls.id
    LEFT JOIN active_shops ash
        ON ash.dimension = k.dimension AND ash.chunk_x = k.chunk_x AND ash.chunk_z = k.chunk_z
    LEFT JOIN active_waystones aws
        ON aws.dimension = k.dimension AND aws.chunk_x = k.chunk_x AND aws.chunk_z = k.chunk_z
    LEFT JOIN ever_shops esh
        ON esh.dimension = k.dimension AND esh.chunk_x = k.chunk_x AND esh.chunk_z = k.chunk_z
    LEFT JOIN ever_waystones ews
        ON ews.dimension = k.dimension AND ews.chunk_x = k.chunk_x AND ews.chunk_z = k.chunk_z
"#;

/// Every chunk that was scanned or holds an active waystone, newest scan
/// first.
///
/// `limit` falls back to `default_limit` and is capped at `max_limit`;
/// `offset` applies after filtering.
pub fn chunk_summaries(
    conn: &DbConnection,
    query: &ChunkQuery,
    now: DateTime<Utc>,
    default_limit: usize,
    max_limit: usize,
) -> Result<Vec<ChunkSummary>> {
    let (filter, params): (&str, Vec<DbValue>) = match query.dimension {
        Some(dimension) => (" WHERE k.dimension = ?", vec![dimension.as_str().into()]),
        None => ("", Vec::new()),
    };
    let sql = format!(
        "{CHUNK_SUMMARY_SQL}{filter} \
         ORDER BY sc.latest DESC NULLS LAST, k.dimension, k.chunk_x, k.chunk_z"
    );
    let limit = query.limit.unwrap_or(default_limit).min(max_limit);

    let mut summaries = Vec::new();
    for row in conn.query_all(&sql, &params)? {
        let dimension_raw: String = row.get(0)?;
        let latest_scanned_at = row.get::<Option<i64>>(4)?.map(decode_time);
        let active_waystones: i64 = row.get(6)?;
        let last_observed_waystones: i64 = row.get(8)?;
        summaries.push(ChunkSummary {
            dimension: decode_dimension(&dimension_raw)?,
            chunk: ChunkCoord::new(row.get(1)?, row.get(2)?),
            total_scans: row.get(3)?,
            latest_scanned_at,
            minutes_since_last_scan: latest_scanned_at.map(|at| (now - at).num_minutes()),
            active_shops: row.get(5)?,
            active_waystones,
            last_observed_shops: row.get(7)?,
            last_observed_waystones: last_observed_waystones.max(active_waystones),
            ever_observed_shops: row.get(9)?,
            ever_observed_waystones: row.get(10)?,
        });
    }

    Ok(summaries
        .into_iter()
        .filter(|chunk| query.matches(chunk))
        .skip(query.offset)
        .take(limit)
        .collect())
}

/// Nearest waystone for `position`.
///
/// Returns the stored annotation when an active shop sits there; otherwise
/// computes the nearest active waystone on the fly with the same rule.
pub fn nearest_waystone(conn: &DbConnection, position: &Position) -> Result<Option<NearestWaystone>> {
    let sql = format!(
        "{SHOP_SELECT} WHERE s.dimension = ? AND s.pos_x = ? AND s.pos_y = ? AND s.pos_z = ? \
         AND s.removed_at IS NULL"
    );
    if let Some(row) = conn.query_optional(&sql, &position_params(position))? {
        return Ok(row_to_shop_state(&row)?.nearest_waystone);
    }

    let waystones = query_active_waystones(
        conn,
        &WaystoneFilter {
            dimension: Some(position.dimension),
            ..WaystoneFilter::default()
        },
    )?;
    let landmarks: Vec<Landmark> = waystones
        .iter()
        .map(|w| Landmark {
            id: w.id,
            position: w.position,
        })
        .collect();

    Ok(select_nearest(position, &landmarks).and_then(|(landmark, distance_sq)| {
        waystones
            .iter()
            .find(|w| w.id == landmark.id)
            .map(|w| NearestWaystone {
                waystone_id: w.id,
                name: w.name.clone(),
                owner: w.owner.clone(),
                position: w.position,
                distance_sq,
            })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(minutes: Option<i64>, ever_shops: i64, ever_waystones: i64) -> ChunkSummary {
        ChunkSummary {
            dimension: Dimension::Overworld,
            chunk: ChunkCoord::new(0, 0),
            total_scans: minutes.map_or(0, |_| 1),
            latest_scanned_at: None,
            minutes_since_last_scan: minutes,
            active_shops: 0,
            active_waystones: 0,
            last_observed_shops: 0,
            last_observed_waystones: 0,
            ever_observed_shops: ever_shops,
            ever_observed_waystones: ever_waystones,
        }
    }

    #[test]
    fn stale_filter_keeps_old_and_never_scanned_chunks() {
        let query = ChunkQuery {
            stale_minutes: Some(30),
            ..ChunkQuery::default()
        };
        assert!(!query.matches(&chunk(Some(5), 0, 0)));
        assert!(query.matches(&chunk(Some(30), 0, 0)));
        assert!(query.matches(&chunk(None, 0, 1)));
    }

    #[test]
    fn ever_bounds_and_waystone_presence() {
        let busy = chunk(Some(1), 4, 2);
        let empty = chunk(Some(1), 0, 0);

        let min_ever = ChunkQuery {
            min_ever: Some(3),
            ..ChunkQuery::default()
        };
        assert!(min_ever.matches(&busy));
        assert!(!min_ever.matches(&empty));

        let min_waystones = ChunkQuery {
            min_ever_waystones: Some(3),
            ..ChunkQuery::default()
        };
        assert!(!min_waystones.matches(&busy));

        let with = ChunkQuery {
            has_waystones: Some(true),
            ..ChunkQuery::default()
        };
        let without = ChunkQuery {
            has_waystones: Some(false),
            ..ChunkQuery::default()
        };
        assert!(with.matches(&busy) && !with.matches(&empty));
        assert!(without.matches(&empty) && !without.matches(&busy));
    }
}
