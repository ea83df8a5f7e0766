//! CLI command implementations.

mod start;

pub use start::{run_check, run_start};
