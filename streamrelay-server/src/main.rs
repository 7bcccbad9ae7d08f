//! Command-line entry point for the streamrelay server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use server::server as relay;
use shared::config::server::Config;

/// Main CLI structure for streamrelay
#[derive(Debug, Parser)]
#[command(name = "streamrelay")]
#[command(about = "Relays live and clip events from a streaming platform to chat channels", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Port to bind, overriding the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a yaml, toml or json configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run one reconciliation sweep and exit
    Sweep {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

async fn run_app(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { port, config } => {
            let config = Config::load_config(config, port)?;
            relay::run(config).await
        }
        Commands::Sweep { config } => {
            let config = Config::load_config(config, None)?;
            let report = relay::run_sweep(config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    run_app(Cli::parse()).await
}
