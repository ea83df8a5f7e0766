//! Core broker infrastructure.
//!
//! - `config` - Options parsing and validation
//! - `broker` - Session map, admission and shutdown

pub mod broker;
pub mod config;

pub use broker::*;
pub use config::*;
