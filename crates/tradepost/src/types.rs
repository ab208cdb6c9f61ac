//! Core value types for the scan ledger.
//!
//! A [`Position`] is the reconciliation identity for both shops and
//! waystones. Chunks are 16x16 horizontal cells and are the unit of
//! closed-world pruning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of a chunk along x and z, in blocks.
pub const CHUNK_SIZE: i32 = 16;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_row_id {
    ($name:ident, $label:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }

        impl From<$name> for tradepost_db::DbValue {
            fn from(id: $name) -> Self {
                tradepost_db::DbValue::Integer(id.0)
            }
        }
    };
}

define_row_id!(ScanId, "scan");
define_row_id!(ShopStateId, "shop");
define_row_id!(WaystoneStateId, "waystone");

// ============================================================================
// Enumerations
// ============================================================================

/// One of the parallel world spaces. Nothing crosses dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Overworld,
    Nether,
    End,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Overworld, Dimension::Nether, Dimension::End];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overworld => "overworld",
            Self::Nether => "nether",
            Self::End => "end",
        }
    }

    /// Lenient parse: case-insensitive labels, `the_` prefixed aliases and numeric codes.
    pub fn parse(s: &str) -> Option<Self> {
        let lowered = s.trim().to_lowercase();
        match lowered.as_str() {
            "overworld" | "the_overworld" | "the overworld" | "0" => Some(Self::Overworld),
            "nether" | "the_nether" | "the nether" | "1" => Some(Self::Nether),
            "end" | "the_end" | "the end" | "2" => Some(Self::End),
            _ => None,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown dimension: {}", s))
    }
}

/// What a shop does with its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShopAction {
    #[serde(rename = "sell")]
    Sell,
    #[serde(rename = "buy")]
    Buy,
    #[serde(rename = "out of stock")]
    OutOfStock,
}

impl ShopAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
            Self::OutOfStock => "out of stock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "sell" => Some(Self::Sell),
            "buy" => Some(Self::Buy),
            "out of stock" | "out_of_stock" => Some(Self::OutOfStock),
            _ => None,
        }
    }
}

impl fmt::Display for ShopAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShopAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown shop action: {}", s))
    }
}

/// Where a waystone version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaystoneSource {
    /// Explicit user-submitted metadata. Never pruned by chunk scans.
    Ui,
    /// Passive sighting while scanning a chunk.
    Chunk,
}

impl WaystoneSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ui => "ui",
            Self::Chunk => "chunk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ui" => Some(Self::Ui),
            "chunk" => Some(Self::Chunk),
            _ => None,
        }
    }
}

impl fmt::Display for WaystoneSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WaystoneSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Unknown waystone source: {}", s))
    }
}

// ============================================================================
// Spatial Types
// ============================================================================

/// A block position. Ordering is dimension first, then x, y, z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub dimension: Dimension,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Position {
    pub fn new(dimension: Dimension, x: i32, y: i32, z: i32) -> Self {
        Self { dimension, x, y, z }
    }

    pub fn chunk(&self) -> ChunkKey {
        ChunkKey::new(self.dimension, ChunkCoord::containing(self.x, self.z))
    }

    /// Squared Euclidean distance, saturating at `i64::MAX`.
    ///
    /// Meaningless across dimensions; callers filter first.
    pub fn distance_sq(&self, other: &Position) -> i64 {
        let dx = self.x as i64 - other.x as i64;
        let dy = self.y as i64 - other.y as i64;
        let dz = self.z as i64 - other.z as i64;
        dx.saturating_mul(dx)
            .saturating_add(dy.saturating_mul(dy))
            .saturating_add(dz.saturating_mul(dz))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}, {})", self.dimension, self.x, self.y, self.z)
    }
}

/// Chunk coordinates within a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkCoord {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoord {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// The chunk containing block (x, z): floor division by 16.
    pub fn containing(block_x: i32, block_z: i32) -> Self {
        Self {
            x: block_x.div_euclid(CHUNK_SIZE),
            z: block_z.div_euclid(CHUNK_SIZE),
        }
    }
}

/// A chunk qualified by its dimension; the grouping key for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub dimension: Dimension,
    pub chunk: ChunkCoord,
}

impl ChunkKey {
    pub fn new(dimension: Dimension, chunk: ChunkCoord) -> Self {
        Self { dimension, chunk }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} chunk ({}, {})", self.dimension, self.chunk.x, self.chunk.z)
    }
}

// ============================================================================
// Scans
// ============================================================================

/// Per-scan switches, recorded with the scan so journal replay matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOptions {
    #[serde(default)]
    pub skip_shop_reconcile: bool,
    #[serde(default)]
    pub skip_waystone_reconcile: bool,
}

/// A scan about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewScan {
    pub sender_id: String,
    pub dimension: Dimension,
    pub chunk: ChunkCoord,
    pub scanned_at: DateTime<Utc>,
}

/// A recorded scan. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scan {
    pub id: ScanId,
    pub sender_id: String,
    pub dimension: Dimension,
    pub chunk: ChunkCoord,
    pub scanned_at: DateTime<Utc>,
    pub options: IngestOptions,
}

impl Scan {
    pub fn chunk_key(&self) -> ChunkKey {
        ChunkKey::new(self.dimension, self.chunk)
    }

    pub fn scanned_at_millis(&self) -> i64 {
        self.scanned_at.timestamp_millis()
    }
}

// ============================================================================
// Observations
// ============================================================================

/// A complete shop sighting. Incomplete rows never become one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopObservation {
    pub position: Position,
    pub owner: String,
    pub item: String,
    pub price: f64,
    pub amount: i64,
    pub action: ShopAction,
}

/// A waystone sighting from one of the two sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum WaystoneObservation {
    /// Authoritative metadata pushed from the client UI.
    Ui {
        position: Position,
        name: String,
        owner: String,
    },
    /// Passive sighting; usually anonymous.
    Chunk {
        position: Position,
        name: Option<String>,
        owner: Option<String>,
    },
}

impl WaystoneObservation {
    pub fn position(&self) -> &Position {
        match self {
            Self::Ui { position, .. } | Self::Chunk { position, .. } => position,
        }
    }

    pub fn source(&self) -> WaystoneSource {
        match self {
            Self::Ui { .. } => WaystoneSource::Ui,
            Self::Chunk { .. } => WaystoneSource::Chunk,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Ui { name, .. } => Some(name.as_str()),
            Self::Chunk { name, .. } => name.as_deref(),
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Ui { owner, .. } => Some(owner.as_str()),
            Self::Chunk { owner, .. } => owner.as_deref(),
        }
    }
}

// ============================================================================
// Stored States
// ============================================================================

/// Resolved nearest-waystone annotation, joined at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearestWaystone {
    pub waystone_id: WaystoneStateId,
    pub name: String,
    pub owner: String,
    pub position: Position,
    pub distance_sq: i64,
}

/// One version of a shop at a Position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopState {
    pub id: ShopStateId,
    pub position: Position,
    pub chunk: ChunkCoord,
    pub owner: String,
    pub item: String,
    pub price: f64,
    pub amount: i64,
    pub action: ShopAction,
    pub first_seen_at: DateTime<Utc>,
    pub first_seen_scan: ScanId,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_scan: ScanId,
    /// `None` while this is the active version.
    pub removed_at: Option<DateTime<Utc>>,
    pub nearest_waystone: Option<NearestWaystone>,
}

impl ShopState {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

/// One version of a waystone at a Position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaystoneState {
    pub id: WaystoneStateId,
    pub position: Position,
    pub chunk: ChunkCoord,
    pub name: String,
    pub owner: String,
    pub source: WaystoneSource,
    pub first_seen_at: DateTime<Utc>,
    pub first_seen_scan: ScanId,
    pub last_seen_at: DateTime<Utc>,
    pub last_seen_scan: ScanId,
    pub removed_at: Option<DateTime<Utc>>,
}

impl WaystoneState {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Per-entity counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub extended: usize,
    pub superseded: usize,
    pub pruned: usize,
    pub ignored: usize,
}

impl ReconcileSummary {
    pub fn absorb(&mut self, other: ReconcileSummary) {
        self.inserted += other.inserted;
        self.extended += other.extended;
        self.superseded += other.superseded;
        self.pruned += other.pruned;
        self.ignored += other.ignored;
    }
}

/// Outcome of one committed scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub scan_id: ScanId,
    pub shops: ReconcileSummary,
    pub waystones: ReconcileSummary,
    pub annotations_recomputed: usize,
}

/// Outcome of replaying the observation journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    pub scans_replayed: usize,
    pub shop_observations: usize,
    pub waystone_observations: usize,
    pub active_shops: usize,
    pub active_waystones: usize,
}
