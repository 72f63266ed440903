//! Configuration management commands

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;

use rlretry::Settings;

const CONFIG_FILE: &str = "rlretry.toml";

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Check the configuration without running anything
    Validate,
    /// Write a configuration file with default values
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub fn run(cmd: ConfigCommands, settings: &Settings) -> Result<()> {
    match cmd {
        ConfigCommands::Show => show(settings),
        ConfigCommands::Validate => validate(settings),
        ConfigCommands::Init { force } => init(force),
    }
}

fn show(settings: &Settings) -> Result<()> {
    println!("{}", settings.to_toml()?);
    Ok(())
}

fn validate(settings: &Settings) -> Result<()> {
    let runtime = settings.validate()?;
    println!("Configuration is valid");
    println!("  timeout:       {:?}", runtime.retry.timeout);
    println!("  max_retries:   {}", runtime.retry.max_retries);
    println!("  actions:       {}", runtime.retry.ladder.action_space_size());
    match &runtime.weights_dir {
        Some(dir) => println!(
            "  weights:       {} ({})",
            dir.display(),
            if runtime.distributed { "distributed" } else { "single writer" }
        ),
        None => println!("  weights:       in memory only"),
    }
    Ok(())
}

fn init(force: bool) -> Result<()> {
    if Path::new(CONFIG_FILE).exists() && !force {
        println!("Configuration file already exists: {CONFIG_FILE}");
        println!("Use --force to overwrite");
        return Ok(());
    }

    let contents = Settings::default().to_toml()?;
    std::fs::write(CONFIG_FILE, contents)
        .with_context(|| format!("Failed to write {CONFIG_FILE}"))?;
    println!("Created configuration file: {CONFIG_FILE}");
    Ok(())
}
