//! Infrastructure layer for bus-relay.
//!
//! Everything that touches the outside world: the bus TCP listener and
//! per-connection tasks, the axum HTTP bridge, the outbound webhook client,
//! and the TOML configuration file.

pub mod http;
pub mod network;
pub mod server;
pub mod storage;
pub mod webhook;

pub use server::RelayServer;
pub use webhook::WebhookDispatcher;
