//! FluxMQ CLI.
//!
//! - `fluxmq start` - Start the broker
//! - `fluxmq check` - Validate a configuration file

mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, StartArgs};
