//! Shelf: product catalog loader and department normalizer
//!
//! Main binary with subcommands:
//! - `ingest`: Load the catalog CSV export into the pre-normalization schema
//! - `migrate`: Move `products.department` into the `departments` table
//! - `check`: Report the catalog's structure and normalization state

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use shelf_schema::{Database, DbConfig, Ident, SchemaLayout};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod check;
mod ingest;
mod migrate;

/// Longest lease `--lock-ttl-secs` accepts.
const MAX_LOCK_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Parser)]
#[command(name = "shelf")]
#[command(about = "Product catalog loader and department normalizer", long_about = None)]
struct Cli {
    #[command(flatten)]
    db: DbArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Connection settings shared by every subcommand.
#[derive(Args)]
struct DbArgs {
    /// SQLite database file
    #[arg(long, global = true, env = "SHELF_DATABASE", default_value = "shelf.db")]
    database: PathBuf,

    /// Milliseconds to wait on a locked database before failing
    #[arg(long, global = true, env = "SHELF_BUSY_TIMEOUT_MS", default_value = "5000")]
    busy_timeout_ms: u64,
}

impl DbArgs {
    fn open(&self) -> Result<Database> {
        let config = DbConfig::new(&self.database)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout_ms));
        Database::open(&config).into_diagnostic()
    }
}

/// Table and column names, for catalogs that do not use the defaults.
#[derive(Args)]
struct LayoutArgs {
    /// Table holding the free-text column
    #[arg(long, default_value = "products")]
    fact_table: Ident,

    /// Free-text column to normalize
    #[arg(long, default_value = "department")]
    legacy_column: Ident,

    /// Lookup table to create
    #[arg(long, default_value = "departments")]
    reference_table: Ident,

    /// Foreign-key column to add
    #[arg(long, default_value = "department_id")]
    reference_column: Ident,

    /// Column shown when sampling rows
    #[arg(long, default_value = "name")]
    label_column: Ident,
}

impl LayoutArgs {
    fn layout(self) -> Result<SchemaLayout> {
        let layout = SchemaLayout::new(
            self.fact_table,
            self.legacy_column,
            self.reference_table,
            self.reference_column,
        )
        .into_diagnostic()?;
        Ok(layout.with_label_column(self.label_column))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load the catalog CSV export, replacing existing rows
    Ingest {
        /// Products CSV
        #[arg(long)]
        products: PathBuf,

        /// Distribution centers CSV
        #[arg(long)]
        distribution_centers: PathBuf,
    },

    /// Normalize the legacy column into a reference table
    Migrate {
        #[command(flatten)]
        layout: LayoutArgs,

        /// Preview pending steps without applying them
        #[arg(long)]
        dry_run: bool,

        /// Seconds before an abandoned migration lock may be taken over (at most one year)
        #[arg(
            long,
            default_value = "600",
            value_parser = clap::value_parser!(u64).range(1..=MAX_LOCK_TTL_SECS)
        )]
        lock_ttl_secs: u64,
    },

    /// Report structure, normalization state and reference usage
    Check {
        #[command(flatten)]
        layout: LayoutArgs,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "shelf=info,shelf_schema=info,shelf_ingest=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            products,
            distribution_centers,
        } => ingest::run(&cli.db, products, distribution_centers),

        Commands::Migrate {
            layout,
            dry_run,
            lock_ttl_secs,
        } => migrate::run(
            &cli.db,
            layout.layout()?,
            dry_run,
            Duration::from_secs(lock_ttl_secs),
        ),

        Commands::Check { layout } => check::run(&cli.db, layout.layout()?),
    }
}
