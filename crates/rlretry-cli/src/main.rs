//! rlretry CLI - train, inspect and merge adaptive retry weights
//!
//! The library is meant to be embedded; this binary exercises it against a
//! mock server and manages the weight checkpoints it produces.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod simulator;

use commands::{config, simulate, weights};
use rlretry::Settings;

#[derive(Parser)]
#[command(name = "rlretry")]
#[command(author, version, about = "rlretry - adaptive retry policy tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to RLRETRY_CONFIG, ./rlretry.toml, ~/.config/rlretry/rlretry.toml)
    #[arg(short, long, global = true, env = "RLRETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a policy against a simulated flaky server
    Simulate(simulate::SimulateArgs),

    /// Print the tables stored in a checkpoint
    Inspect {
        /// Checkpoint file or weights directory
        path: PathBuf,
    },

    /// Merge two checkpoints into one
    Merge {
        left: PathBuf,
        right: PathBuf,
        /// Output checkpoint file or directory
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(path))?,
        None => Settings::load()?,
    };

    // Initialize logging based on verbosity
    let log_level = if cli.verbose {
        "debug"
    } else {
        settings.logging.level.as_str()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("rlretry={log_level},rlretry_rl={log_level},rlretry_cli={log_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Simulate(args) => simulate::run(args, settings).await,
        Commands::Inspect { path } => weights::inspect(&path),
        Commands::Merge {
            left,
            right,
            output,
        } => weights::merge(&left, &right, &output),
        Commands::Config(cmd) => config::run(cmd, &settings),
    }
}
