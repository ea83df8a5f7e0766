//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// FluxMQ - MQTT broker core.
#[derive(Parser)]
#[command(name = "fluxmq")]
#[command(version)]
#[command(about = "FluxMQ MQTT broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Validate a configuration file and exit
    Check(CheckArgs),
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file (TOML, or JSON by extension)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrent client connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Write the process id to this file
    #[arg(long = "pid")]
    pub pid_file: Option<PathBuf>,

    /// Username clients must present
    #[arg(long = "user", requires = "password")]
    pub username: Option<String>,

    /// Password clients must present
    #[arg(long = "pass", requires = "username")]
    pub password: Option<String>,

    /// Token clients may present in the password field
    #[arg(long = "auth")]
    pub token: Option<String>,

    /// Log filter, e.g. `info` or `fluxmq=debug`
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

// -----------------------------------------------------------------------------
// Check command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags_parse() {
        let cli = Cli::try_parse_from([
            "fluxmq", "start", "--port", "4222", "--user", "u", "--pass", "p", "--json-logs",
        ])
        .unwrap();
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.port, Some(4222));
        assert_eq!(args.username.as_deref(), Some("u"));
        assert!(args.json_logs);
    }

    #[test]
    fn user_requires_pass() {
        assert!(Cli::try_parse_from(["fluxmq", "start", "--user", "u"]).is_err());
    }
}
