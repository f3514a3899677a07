//! KSAMATI CLI
//!
//! Read-only reporting tools for KSAMATI sync stores.
//!
//! # Commands
//!
//! - `tables` - Show table existence, row counts and journal health
//! - `pending` - List change log entries not yet settled
//! - `conflicts` - List sync conflicts
//! - `devices` - Show per-device sync status
//! - `verify` - Verify journal integrity
//! - `dump-journal` - Dump journal records for debugging
//!
//! The store is opened read-only and without its lock, so the commands can
//! run next to a live process. Nothing is ever written.

mod commands;
mod frames;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// KSAMATI sync store reporting tools.
#[derive(Parser)]
#[command(name = "ksamati")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

/// Output format of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show table existence, row counts and journal health
    Tables,

    /// List change log entries not yet settled
    Pending {
        /// Only show entries of this device
        #[arg(short, long)]
        device: Option<String>,

        /// Maximum number of entries per device
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List sync conflicts
    Conflicts {
        /// Include closed conflicts
        #[arg(short, long)]
        all: bool,
    },

    /// Show per-device sync status
    Devices,

    /// Verify journal integrity
    Verify,

    /// Dump journal records for debugging
    DumpJournal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only show records of this table
        #[arg(short, long)]
        table: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format;
    match cli.command {
        Commands::Tables => {
            let path = cli.path.ok_or("Store path required for tables")?;
            commands::tables::run(&path, format)?;
        }
        Commands::Pending { device, limit } => {
            let path = cli.path.ok_or("Store path required for pending")?;
            commands::pending::run(&path, device.as_deref(), limit, format)?;
        }
        Commands::Conflicts { all } => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            commands::conflicts::run(&path, all, format)?;
        }
        Commands::Devices => {
            let path = cli.path.ok_or("Store path required for devices")?;
            commands::devices::run(&path, format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, format)?;
        }
        Commands::DumpJournal { limit, table } => {
            let path = cli.path.ok_or("Store path required for dump-journal")?;
            commands::dump_journal::run(&path, limit, table.as_deref(), format)?;
        }
        Commands::Version => {
            println!("KSAMATI CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Sync protocol v{}",
                ksamati_sync_protocol::PROTOCOL_VERSION
            );
            println!("Journal format v{}", ksamati_store::JOURNAL_VERSION);
        }
    }

    Ok(())
}
