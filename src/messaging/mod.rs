//! Messaging primitives shared by the session layer.
//!
//! - `topics` - MQTT topic matching, filter validation, queue-group selection

pub mod topics;

pub use topics::*;
