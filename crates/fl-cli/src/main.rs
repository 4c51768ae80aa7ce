//! Fedlink CLI
//!
//! Command-line entry point for a Fedlink overlay node.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { config, overrides } => {
            cli::run::run(config, overrides).await?;
        }
        Commands::Init { config, force } => {
            cli::init::run(config, force)?;
        }
        Commands::Info { config } => {
            cli::info::run(config)?;
        }
    }

    Ok(())
}
