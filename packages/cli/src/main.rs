#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for docsync.
//!
//! Uses `indicatif-log-bridge` (via [`docsync_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

mod config;
mod migrate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docsync_checkpoint::{CheckpointStore as _, FileCheckpointStore};

use crate::config::{DocsyncConfig, config_path};

#[derive(Parser)]
#[command(name = "docsync", about = "Document store migration and change capture")]
struct Cli {
    /// Config file (overrides `DOCSYNC_CONFIG`, default `docsync.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every configured transfer and mirror live changes
    Migrate {
        /// Keep mirroring live changes after the copies finish, until ctrl-c
        #[arg(long)]
        follow: bool,
        /// Comma-separated migration keys to run (overrides `DOCSYNC_TRANSFERS` env var)
        #[arg(long)]
        transfers: Option<String>,
    },
    /// Inspect or remove saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// List saved checkpoints
    List,
    /// Remove a saved checkpoint so its transfer starts over
    Clear {
        /// Checkpoint id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = docsync_cli_utils::init_logger();
    let cli = Cli::parse();

    let path = config_path(cli.config);
    let config = DocsyncConfig::load(&path)?;

    match cli.command {
        Commands::Migrate { follow, transfers } => {
            let transfers = config.enabled_transfers(transfers);
            migrate::run(&config, &transfers, follow, &multi).await?;
        }
        Commands::Checkpoints { command } => {
            let store = FileCheckpointStore::new(&config.checkpoints.dir);
            match command {
                CheckpointCommands::List => {
                    let checkpoints = store.list().await?;
                    println!(
                        "{:<30} {:>12} {:>10} {:<24} UPDATED",
                        "ID", "TRANSFERRED", "FAILED", "LAST ID"
                    );
                    println!("{}", "-".repeat(100));
                    for checkpoint in &checkpoints {
                        println!(
                            "{:<30} {:>12} {:>10} {:<24} {}",
                            checkpoint.id,
                            checkpoint.success_count,
                            checkpoint.failure_count,
                            checkpoint.last_processed_id.as_deref().unwrap_or("-"),
                            checkpoint.updated_at.to_rfc3339()
                        );
                    }
                }
                CheckpointCommands::Clear { id } => {
                    store.delete(&id).await?;
                    log::info!("Removed checkpoint {id}");
                }
            }
        }
        Commands::Config => {
            println!("# {}", path.display());
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
