//! Domain layer for bus-relay.
//!
//! Pure types with no dependency on sockets, runtimes, or HTTP frameworks:
//! the runtime configuration and the validated form of an HTTP broadcast
//! request.

pub mod command;
pub mod config;

pub use command::{BroadcastRequest, TargetSelector, ValidationError, COMMAND_ENVELOPE};
pub use config::{derive_api_port, RelayConfig, WebhookConfig};
