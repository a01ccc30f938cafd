use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::*;
use config::NodeConfig;

#[derive(Parser)]
#[command(name = "qe-node")]
#[command(author, version, about = "Query Engine node - runs distributed query fragments", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run task plans on a local worker
    Run {
        /// Task plan files (JSON)
        #[arg(required = true)]
        plans: Vec<PathBuf>,
    },

    /// Check task plans without running them
    Validate {
        /// Task plan files (JSON)
        #[arg(required = true)]
        plans: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        NodeConfig::from_file(config_path)?
    } else {
        NodeConfig::default()
    };

    // Initialize logging
    init_logging(cli.verbose, &config.log_level)?;

    let failed = match &cli.command {
        Commands::Run { plans } => run_plans(&config, plans)?,
        Commands::Validate { plans } => validate_plans(plans)?,
    };

    if failed > 0 {
        anyhow::bail!("{} of the given plans did not succeed", failed);
    }
    println!("{}", "All plans succeeded".bright_green());
    Ok(())
}

fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let level = if verbose { "debug" } else { level };
    let filter = format!(
        "qe_node={level},query_distributed={level},query_core={level}",
        level = level
    );

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
