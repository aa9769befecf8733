//! vpactl - command-line client for the vertical resource recommender
//!
//! Reads recommendations, health and checkpoint listings from the
//! recommender's HTTP API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{debug, recommendations};

/// Vertical resource recommender CLI
#[derive(Parser)]
#[command(name = "vpactl")]
#[command(author, version, about = "CLI for the vertical resource recommender", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via VPACTL_API_URL env var)
    #[arg(long, env = "VPACTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get resource recommendations
    #[command(subcommand)]
    Get(GetCommands),

    /// Debug and troubleshooting commands
    #[command(subcommand)]
    Debug(DebugCommands),
}

#[derive(Subcommand)]
pub enum GetCommands {
    /// Get recommendations
    Recommendations {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,

        /// Filter by workload name (substring match)
        #[arg(long, short)]
        workload: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DebugCommands {
    /// Show recommender health and liveness
    Health,

    /// List stored checkpoints
    Checkpoints {
        /// Filter by namespace
        #[arg(long, short)]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let api_url = config.api_url(cli.api_url);
    if cli.verbose {
        output::print_info(&format!("Using API at {}", api_url));
    }

    // Initialize client
    let client = client::ApiClient::new(&api_url)?;

    // Execute command
    match cli.command {
        Commands::Get(get_cmd) => match get_cmd {
            GetCommands::Recommendations {
                namespace,
                workload,
            } => {
                let namespace = config.namespace(namespace);
                recommendations::get_recommendations(&client, namespace, workload, cli.format)
                    .await?;
            }
        },
        Commands::Debug(debug_cmd) => match debug_cmd {
            DebugCommands::Health => {
                debug::show_health(&client, cli.format).await?;
            }
            DebugCommands::Checkpoints { namespace } => {
                let namespace = config.namespace(namespace);
                debug::show_checkpoints(&client, namespace, cli.format).await?;
            }
        },
    }

    Ok(())
}
