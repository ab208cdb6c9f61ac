//! Tradepost - scan ledger for trade shops and waystones
//!
//! Clients scan world chunks and report the shop signs and waystones they
//! see. The ledger reconciles each scan into a per-Position version
//! history and keeps every active shop annotated with its nearest waystone.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌───────────────┐
//! │  ScanBatch  │     │    Scan     │     │    Shop /   │     │   Nearest     │
//! │ (validate)  │────▶│  + journal  │────▶│  Waystone   │────▶│  waystone     │
//! │             │     │             │     │  reconcile  │     │  annotation   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └───────────────┘
//!                        one transaction per scan, all or nothing
//! ```
//!
//! # Core Concepts
//!
//! - **Position**: (dimension, x, y, z); the identity of a shop or waystone
//! - **Version**: one state of the object at a Position; at most one is active
//! - **Closed world**: a chunk scan lists everything in the chunk, so an
//!   unreported shop is retired
//! - **ui vs chunk**: ui waystone metadata is authoritative and never pruned;
//!   chunk sightings only confirm or, when named, create

pub mod batch;
pub mod chunk;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ledger;
pub mod merge;
pub mod nearest;
pub mod query;
pub mod schema;
pub mod shops;
pub mod types;
pub mod waystones;

// Re-exports for convenience
pub use batch::{ScanBatch, ShopInput, ValidatedBatch, WaystoneInput};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use ledger::ScanLedger;
pub use nearest::Invalidation;
pub use query::{ChunkQuery, ChunkSummary, OfferBook, OfferQuery, ShopFilter, WaystoneFilter};
pub use types::{
    ChunkCoord, ChunkKey, Dimension, IngestOptions, IngestReport, NearestWaystone, NewScan,
    Position, RebuildReport, ReconcileSummary, Scan, ScanId, ShopAction, ShopObservation,
    ShopState, ShopStateId, WaystoneObservation, WaystoneSource, WaystoneState, WaystoneStateId,
};
