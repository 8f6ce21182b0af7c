//! Application layer for bus-relay.
//!
//! Knows *what* happens to a message, never *how* bytes reach a socket.
//!
//! - [`registry`] – the table of live connections and their outbound queues
//! - [`router`] – relay, targeted broadcast, webhook diversion, system messages
//! - [`notifier`] – the outbound notification seam the router calls into

pub mod notifier;
pub mod registry;
pub mod router;

pub use notifier::{DispatchError, Notifier};
pub use registry::{
    BusDelivery, ConnectionId, ConnectionInfo, ConnectionRegistry, DeliveryError,
    DisconnectReason, Registration,
};
pub use router::{BroadcastOutcome, BroadcastRouter, RouterError, RouterStats};
