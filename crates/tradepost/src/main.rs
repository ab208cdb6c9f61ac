//! Tradepost command line
//!
//! Writes hold the ledger's single-writer lock; queries open read-only and
//! can run beside a writer. All output is pretty JSON on stdout.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tradepost::{
    ChunkCoord, ChunkQuery, Dimension, Invalidation, LedgerConfig, LedgerError, OfferQuery, Position,
    ScanBatch, ScanLedger, ShopAction, ShopFilter, WaystoneFilter, WaystoneInput, WaystoneSource,
};
use tradepost_logging::LogConfig;

/// Exit code for a scan that was already recorded.
const EXIT_DUPLICATE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "tradepost", version, about = "Scan ledger for trade shops and waystones")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "TRADEPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger file; overrides the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// A block position given as flags.
#[derive(clap::Args, Debug, Clone, Copy)]
struct PositionArgs {
    #[arg(long)]
    dimension: Dimension,
    #[arg(long, allow_negative_numbers = true)]
    x: i32,
    #[arg(long, allow_negative_numbers = true)]
    y: i32,
    #[arg(long, allow_negative_numbers = true)]
    z: i32,
}

impl PositionArgs {
    fn position(&self) -> Position {
        Position::new(self.dimension, self.x, self.y, self.z)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a scan batch from a JSON file
    Ingest {
        /// Path to the batch (senderId, dimension, chunkX, chunkZ, shops, waystones)
        file: PathBuf,
    },

    /// Record authoritative waystone metadata from the client UI
    SubmitWaystone {
        #[arg(long)]
        sender: String,
        #[command(flatten)]
        at: PositionArgs,
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
    },

    /// Recompute nearest-waystone annotations
    RecomputeNearest {
        /// Limit to one dimension (default: all)
        #[arg(long)]
        dimension: Option<Dimension>,
    },

    /// Rebuild shop and waystone state from the observation journal
    Rebuild,

    /// List active shops
    Shops {
        #[arg(long)]
        dimension: Option<Dimension>,
        #[arg(long)]
        item: Option<String>,
        #[arg(long)]
        action: Option<ShopAction>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, requires = "chunk_z", allow_negative_numbers = true)]
        chunk_x: Option<i32>,
        #[arg(long, requires = "chunk_x", allow_negative_numbers = true)]
        chunk_z: Option<i32>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List active waystones
    Waystones {
        #[arg(long)]
        dimension: Option<Dimension>,
        #[arg(long)]
        source: Option<WaystoneSource>,
        #[arg(long, requires = "chunk_z", allow_negative_numbers = true)]
        chunk_x: Option<i32>,
        #[arg(long, requires = "chunk_x", allow_negative_numbers = true)]
        chunk_z: Option<i32>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Best offers for an item; both sides unless --action is given
    Offers {
        #[arg(long)]
        item: String,
        #[arg(long)]
        action: Option<ShopAction>,
        #[arg(long)]
        dimension: Option<Dimension>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Items sold or bought by active shops
    Items,

    /// Per-chunk scan coverage and population, newest scan first
    Chunks {
        #[arg(long)]
        dimension: Option<Dimension>,
        /// Only chunks not scanned for at least this many minutes
        #[arg(long)]
        stale_minutes: Option<i64>,
        /// Minimum distinct shops ever observed
        #[arg(long)]
        min_ever: Option<i64>,
        /// Minimum distinct waystones ever observed
        #[arg(long)]
        min_ever_waystones: Option<i64>,
        #[arg(long)]
        has_waystones: Option<bool>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Version history at a position
    History {
        #[command(flatten)]
        at: PositionArgs,
        /// Show waystone versions instead of shop versions
        #[arg(long)]
        waystones: bool,
    },

    /// Nearest waystone for a position
    Nearest {
        #[command(flatten)]
        at: PositionArgs,
    },
}

impl Commands {
    fn writes(&self) -> bool {
        matches!(
            self,
            Commands::Ingest { .. }
                | Commands::SubmitWaystone { .. }
                | Commands::RecomputeNearest { .. }
                | Commands::Rebuild
        )
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = tradepost_logging::init_logging(LogConfig {
        app_name: "tradepost",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: logging disabled: {:#}", err);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let duplicate = err
                .downcast_ref::<LedgerError>()
                .is_some_and(LedgerError::is_duplicate);
            error!(error = %format!("{:#}", err), "Command failed");
            eprintln!("Error: {:#}", err);
            if duplicate {
                ExitCode::from(EXIT_DUPLICATE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Configuration for this invocation: file and environment, then flags.
///
/// `recompute-nearest` does its own pass, so the repair on open is skipped.
fn resolve_config(cli: &Cli) -> Result<LedgerConfig> {
    let mut config =
        LedgerConfig::resolve(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if matches!(cli.command, Commands::RecomputeNearest { .. }) {
        config.repair_nearest_on_open = false;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    let ledger = if cli.command.writes() {
        ScanLedger::open(config)
    } else {
        ScanLedger::open_readonly(config)
    }
    .context("Failed to open ledger")?;

    match cli.command {
        Commands::Ingest { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let batch: ScanBatch = serde_json::from_str(&content)
                .with_context(|| format!("Invalid scan batch in {}", file.display()))?;
            print_json(&ledger.ingest_batch(&batch)?)
        }
        Commands::SubmitWaystone {
            sender,
            at,
            name,
            owner,
        } => {
            let batch = ScanBatch {
                sender_id: sender,
                dimension: Some(at.dimension.as_str().to_string()),
                waystones: vec![WaystoneInput {
                    position: [at.x, at.y, at.z],
                    dimension: None,
                    name: Some(name),
                    owner: Some(owner),
                    source: Some(WaystoneSource::Ui.as_str().to_string()),
                }],
                skip_shop_reconcile: true,
                ..ScanBatch::default()
            };
            print_json(&ledger.ingest_batch(&batch)?)
        }
        Commands::RecomputeNearest { dimension } => {
            let invalidation = match dimension {
                Some(dimension) => Invalidation::dimensions([dimension]),
                None => Invalidation::everything(),
            };
            let recomputed = ledger.recompute_nearest(&invalidation)?;
            print_json(&serde_json::json!({ "annotationsRecomputed": recomputed }))
        }
        Commands::Rebuild => print_json(&ledger.rebuild_from_journal()?),
        Commands::Shops {
            dimension,
            item,
            action,
            owner,
            chunk_x,
            chunk_z,
            limit,
        } => {
            let filter = ShopFilter {
                dimension,
                item,
                action,
                owner,
                chunk: chunk_x.zip(chunk_z).map(|(x, z)| ChunkCoord::new(x, z)),
                limit,
            };
            print_json(&ledger.query_active_shops(&filter)?)
        }
        Commands::Waystones {
            dimension,
            source,
            chunk_x,
            chunk_z,
            limit,
        } => {
            let filter = WaystoneFilter {
                dimension,
                source,
                chunk: chunk_x.zip(chunk_z).map(|(x, z)| ChunkCoord::new(x, z)),
                limit,
            };
            print_json(&ledger.query_active_waystones(&filter)?)
        }
        Commands::Offers {
            item,
            action: Some(action),
            dimension,
            limit,
        } => print_json(&ledger.top_offers(&OfferQuery {
            item,
            action,
            dimension,
            limit,
        })?),
        Commands::Offers {
            item,
            action: None,
            dimension,
            limit,
        } => print_json(&ledger.offer_book(&item, dimension, limit)?),
        Commands::Items => print_json(&ledger.list_items()?),
        Commands::Chunks {
            dimension,
            stale_minutes,
            min_ever,
            min_ever_waystones,
            has_waystones,
            limit,
            offset,
        } => {
            let query = ChunkQuery {
                dimension,
                stale_minutes,
                min_ever,
                min_ever_waystones,
                has_waystones,
                limit,
                offset,
            };
            print_json(&ledger.chunk_summaries(&query, Utc::now())?)
        }
        Commands::History { at, waystones } => {
            let position = at.position();
            if waystones {
                print_json(&ledger.waystone_history(&position)?)
            } else {
                print_json(&ledger.shop_history(&position)?)
            }
        }
        Commands::Nearest { at } => print_json(&ledger.nearest_waystone(&at.position())?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", rendered);
    Ok(())
}
