//! # capflow CLI
//!
//! Command-line interface for inspecting and maintaining analysis state.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "capflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, env = "CAPFLOW_CONFIG", default_value = "capflow.yml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stored state of an analysis
    Inspect {
        /// Analysis ID
        analysis: String,

        /// Also show the state of this entity
        #[arg(long)]
        entity: Option<String>,

        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },

    /// List analyses with stored state and their entities
    List {
        /// Return JSON for machine consumption
        #[arg(long)]
        json: bool,
    },

    /// Remove expired entity and analysis state
    Sweep {
        /// Keep sweeping at the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Inspect {
            analysis,
            entity,
            pretty,
        } => commands::inspect_state(&cli.config, &analysis, entity.as_deref(), pretty),
        Commands::List { json } => commands::list_states(&cli.config, json),
        Commands::Sweep { watch } => {
            if watch {
                commands::watch_sweeps(&cli.config).await
            } else {
                commands::sweep_once(&cli.config)
            }
        }
    }
}
