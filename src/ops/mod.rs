//! Operations support.
//!
//! - `telemetry` - Tracing subscriber setup
//! - `audit` - Audit logging
//! - `pid` - Process id file

pub mod audit;
pub mod pid;
pub mod telemetry;

pub use pid::PidFile;
pub use telemetry::init_tracing;
