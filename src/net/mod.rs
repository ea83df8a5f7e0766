//! Networking layer.
//!
//! - `listeners` - Client admission loop
//! - `security` - Credentials and topic authorization

pub mod listeners;
pub mod security;

pub use listeners::{AcceptBackoff, ACCEPT_MAX_SLEEP, ACCEPT_MIN_SLEEP};
pub use security::*;
