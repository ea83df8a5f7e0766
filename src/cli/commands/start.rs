//! Start command - launches the broker and runs it until interrupted.

use crate::broker::Broker;
use crate::cli::args::{CheckArgs, StartArgs};
use crate::config::Options;
use crate::ops::{init_tracing, PidFile};
use anyhow::{Context, Result};

fn resolve_options(args: &StartArgs) -> Result<Options> {
    let mut opts = match &args.config {
        Some(path) => Options::load(path)?,
        None => {
            let mut opts = Options::default();
            opts.apply_env_overrides()?;
            opts
        }
    };
    if let Some(host) = &args.host {
        opts.host = host.clone();
    }
    if let Some(port) = args.port {
        opts.port = port;
    }
    if let Some(max) = args.max_connections {
        opts.max_connections = max;
    }
    if let Some(pid) = &args.pid_file {
        opts.pid_file = Some(pid.clone());
    }
    if args.username.is_some() {
        opts.auth.username = args.username.clone();
        opts.auth.password = args.password.clone();
    }
    if args.token.is_some() {
        opts.auth.token = args.token.clone();
    }
    if args.log_level.is_some() {
        opts.telemetry.log_level = args.log_level.clone();
    }
    if args.json_logs {
        opts.telemetry.json_logs = true;
    }
    opts.validate()?;
    Ok(opts)
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    let opts = resolve_options(&args)?;
    init_tracing(opts.telemetry.log_level.as_deref(), opts.telemetry.json_logs)?;
    let _pid = opts.pid_file.as_ref().map(PidFile::create).transpose()?;
    let broker = Broker::create(opts).context("unable to create broker")?;
    broker.start().await.context("broker failed")?;
    broker.shutdown().await;
    Ok(())
}

pub fn run_check(args: CheckArgs) -> Result<()> {
    let opts = Options::load(&args.config)?;
    opts.validate()
        .with_context(|| format!("{} is invalid", args.config.display()))?;
    println!("{}: ok", args.config.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::cli::Commands;
    use clap::Parser;
    use tempfile::tempdir;

    fn start_args(argv: &[&str]) -> StartArgs {
        let mut full = vec!["fluxmq", "start"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Start(args) => args,
            Commands::Check(_) => unreachable!(),
        }
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fluxmq.toml");
        std::fs::write(&path, "host = \"127.0.0.1\"\nport = 1999\nmax_connections = 5\n").unwrap();
        let config = path.display().to_string();
        let args = start_args(&["--config", &config, "--max-connections", "2", "--auth", "t0k"]);
        let opts = resolve_options(&args).unwrap();
        assert_eq!(opts.port, 1999);
        assert_eq!(opts.max_connections, 2);
        assert_eq!(opts.auth.token.as_deref(), Some("t0k"));
    }

    #[test]
    fn check_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "max_payload = 0\n").unwrap();
        assert!(run_check(CheckArgs { config: path }).is_err());
    }
}
