//! Shardrig CLI.
//!
//! Stands up a sharded database cluster from a TOML topology description
//! and tears it down again on Ctrl+C.
//!
//! # Quick Start
//!
//! ```bash
//! # Check a topology file without starting anything
//! shardrig validate ./topology.toml
//!
//! # Stand the cluster up and keep it running until Ctrl+C
//! shardrig up ./topology.toml --data-dir ./run
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Shardrig - sharded test clusters as a single fixture.
#[derive(Parser)]
#[command(name = "shardrig")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a topology file without starting any processes.
    Validate {
        /// Path to the TOML topology description.
        topology: String,
    },

    /// Stand up the cluster and keep it running until Ctrl+C.
    Up {
        /// Path to the TOML topology description.
        topology: String,

        /// Directory for cluster data; node data directories are created
        /// underneath it.
        #[arg(short, long, default_value = "./shardrig-data")]
        data_dir: String,

        /// Readiness deadline in seconds.
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { topology } => commands::validate::run(&topology),
        Commands::Up {
            topology,
            data_dir,
            timeout,
        } => commands::up::run(&topology, &data_dir, timeout).await,
    }
}
