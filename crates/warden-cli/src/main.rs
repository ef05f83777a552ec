//! Warden CLI - runs the local API backend and inference runtime.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

/// Warden - supervisor for the app's local services
#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend and the inference runtime until interrupted
    Serve {
        /// Directory containing the backend executable
        #[arg(long)]
        resources_dir: PathBuf,
        /// Only run the backend
        #[arg(long)]
        no_runtime: bool,
    },

    /// Download the runtime and model, then verify the runtime starts
    Setup,

    /// Remove interrupted downloads
    Clean,

    /// Show paths, installed versions and models
    Info {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| miette::miette!("Failed to start async runtime: {}", e))?;

    match cli.command {
        Commands::Serve {
            resources_dir,
            no_runtime,
        } => runtime.block_on(commands::serve::run(&resources_dir, no_runtime)),
        Commands::Setup => runtime.block_on(commands::setup::run()),
        Commands::Clean => runtime.block_on(commands::clean::run()),
        Commands::Info { json } => runtime.block_on(commands::info::run(json)),
    }
}
