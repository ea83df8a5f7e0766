//! FluxMQ - broker entrypoint.
//!
//! Usage:
//!   fluxmq start --config config/fluxmq.toml
//!   fluxmq start --port 1883 --max-connections 1000
//!   fluxmq check --config config/fluxmq.toml

use anyhow::Result;
use clap::Parser;
use fluxmq::cli::commands::{run_check, run_start};
use fluxmq::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Check(args) => run_check(args),
    }
}
