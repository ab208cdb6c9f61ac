//! Scan batch payloads and their validation.
//!
//! A [`ScanBatch`] is what a client submits. [`ScanBatch::validate`] turns it
//! into reconciler input: incomplete shops are dropped and counted, bad
//! labels and missing identities are rejected, and the scan's dimension and
//! chunk are derived from its contents when omitted.

use crate::error::{LedgerError, Result};
use crate::types::{
    ChunkCoord, Dimension, IngestOptions, NewScan, Position, ShopAction, ShopObservation,
    WaystoneObservation, WaystoneSource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBatch {
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub chunk_x: Option<i32>,
    #[serde(default)]
    pub chunk_z: Option<i32>,
    #[serde(default)]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shops: Vec<ShopInput>,
    #[serde(default)]
    pub waystones: Vec<WaystoneInput>,
    #[serde(default)]
    pub skip_shop_reconcile: bool,
    #[serde(default)]
    pub skip_waystone_reconcile: bool,
}

/// One reported shop sign. Price, amount and action may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopInput {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub item: Option<String>,
    pub position: [i32; 3],
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaystoneInput {
    pub position: [i32; 3],
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    /// `ui` or `chunk`; defaults to `chunk`.
    #[serde(default)]
    pub source: Option<String>,
}

/// Reconciler-ready form of a [`ScanBatch`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub scan: NewScan,
    pub options: IngestOptions,
    pub shops: Vec<ShopObservation>,
    pub waystones: Vec<WaystoneObservation>,
    pub dropped_incomplete_shops: usize,
}

fn parse_dimension(raw: &str, field: &str) -> Result<Dimension> {
    Dimension::parse(raw)
        .ok_or_else(|| LedgerError::Validation(format!("{field}: unknown dimension '{raw}'")))
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn position_in(dimension: Dimension, [x, y, z]: [i32; 3]) -> Position {
    Position::new(dimension, x, y, z)
}

impl ScanBatch {
    /// Validate and normalize. `now` stamps batches without `scannedAt`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<ValidatedBatch> {
        let sender_id = self.sender_id.trim();
        if sender_id.is_empty() {
            return Err(LedgerError::Validation("senderId is required".to_string()));
        }

        let declared = self
            .dimension
            .as_deref()
            .map(|raw| parse_dimension(raw, "dimension"))
            .transpose()?;

        let mut shops = Vec::with_capacity(self.shops.len());
        let mut first_position = None;
        let mut dropped_incomplete_shops = 0;
        for (index, input) in self.shops.iter().enumerate() {
            let field = format!("shops[{index}]");
            let (Some(owner), Some(item)) = (non_blank(input.owner.as_ref()), non_blank(input.item.as_ref())) else {
                return Err(LedgerError::Validation(format!("{field} requires owner and item")));
            };
            let dimension = match input.dimension.as_deref() {
                Some(raw) => parse_dimension(raw, &field)?,
                None => declared.ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "{field} missing dimension; provide scan dimension or per-shop dimension"
                    ))
                })?,
            };
            let position = position_in(dimension, input.position);
            first_position.get_or_insert(position);

            let action = input
                .action
                .as_deref()
                .map(|raw| {
                    ShopAction::parse(raw).ok_or_else(|| {
                        LedgerError::Validation(format!(
                            "{field}.action must be one of: buy, sell, out of stock"
                        ))
                    })
                })
                .transpose()?;
            if input.price.is_some_and(|p| !p.is_finite()) {
                return Err(LedgerError::Validation(format!("{field}.price must be finite")));
            }

            match (input.price, input.amount, action) {
                (Some(price), Some(amount), Some(action)) => shops.push(ShopObservation {
                    position,
                    owner: owner.to_string(),
                    item: item.to_string(),
                    price,
                    amount,
                    action,
                }),
                _ => dropped_incomplete_shops += 1,
            }
        }

        let mut waystones = Vec::with_capacity(self.waystones.len());
        for (index, input) in self.waystones.iter().enumerate() {
            let field = format!("waystones[{index}]");
            let dimension = match input.dimension.as_deref() {
                Some(raw) => parse_dimension(raw, &field)?,
                None => declared.ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "{field} missing dimension; provide scan dimension or per-waystone dimension"
                    ))
                })?,
            };
            let position = position_in(dimension, input.position);
            first_position.get_or_insert(position);

            let source = match input.source.as_deref() {
                Some(raw) => WaystoneSource::parse(raw).ok_or_else(|| {
                    LedgerError::Validation(format!("{field}.source must be ui or chunk"))
                })?,
                None => WaystoneSource::Chunk,
            };
            let name = non_blank(input.name.as_ref());
            let owner = non_blank(input.owner.as_ref());
            waystones.push(match source {
                WaystoneSource::Ui => {
                    let (Some(name), Some(owner)) = (name, owner) else {
                        return Err(LedgerError::Validation(format!(
                            "{field}: ui waystones require name and owner"
                        )));
                    };
                    WaystoneObservation::Ui {
                        position,
                        name: name.to_string(),
                        owner: owner.to_string(),
                    }
                }
                WaystoneSource::Chunk => WaystoneObservation::Chunk {
                    position,
                    name: name.map(str::to_string),
                    owner: owner.map(str::to_string),
                },
            });
        }

        let derived = first_position.map(|p| p.chunk());
        let dimension = declared.or(derived.map(|key| key.dimension));
        let chunk_x = self.chunk_x.or(derived.map(|key| key.chunk.x));
        let chunk_z = self.chunk_z.or(derived.map(|key| key.chunk.z));
        let (Some(dimension), Some(chunk_x), Some(chunk_z)) = (dimension, chunk_x, chunk_z) else {
            return Err(LedgerError::Validation(
                "dimension, chunkX, and chunkZ are required when they cannot be derived from shops or waystones"
                    .to_string(),
            ));
        };

        Ok(ValidatedBatch {
            scan: NewScan {
                sender_id: sender_id.to_string(),
                dimension,
                chunk: ChunkCoord::new(chunk_x, chunk_z),
                scanned_at: self.scanned_at.unwrap_or(now),
            },
            options: IngestOptions {
                skip_shop_reconcile: self.skip_shop_reconcile,
                skip_waystone_reconcile: self.skip_waystone_reconcile,
            },
            shops,
            waystones,
            dropped_incomplete_shops,
        })
    }
}
