//! MQTT sessions.
//!
//! - `protocol` - Packet codec for MQTT 3.1, 3.1.1 and 5
//! - `session` - Per-connection state machine and task
//! - `subscriptions` - Topic filter registry and queue groups
//! - `permissions` - Per-session publish authorization cache

pub mod permissions;
pub mod protocol;
pub mod session;
pub mod subscriptions;

pub use permissions::PermissionCache;
pub use session::{SessionPhase, TrafficSnapshot, SERVER_INFO_TOPIC};
pub use subscriptions::{RouteTarget, SubscriptionId, SubscriptionRegistry};
