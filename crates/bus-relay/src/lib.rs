//! bus-relay library crate.
//!
//! A message-bus relay: long-lived automation clients connect over TCP and
//! exchange [`bus_core::Message`] frames, while external callers push one-shot
//! commands in over HTTP.  Commands targeted at a non-bus sentinel are diverted
//! to an outbound webhook instead of the bus.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! TCP bus clients                 HTTP callers (GET /bc, /api/*)
//!         ↕                                  ↓
//! [bus-relay]
//!   ├── domain/           Pure types: RelayConfig, TargetSelector, BroadcastRequest
//!   ├── application/      ConnectionRegistry, BroadcastRouter, Notifier seam
//!   └── infrastructure/
//!         ├── network/    Per-connection read/write tasks (bus-core codec)
//!         ├── http/       axum HTTP bridge and management API
//!         ├── storage/    TOML configuration file
//!         ├── webhook     reqwest-based Notifier
//!         └── server      Accept loop, HTTP serve, lifecycle
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `bus-core`; it never touches a
//!   socket.  Registry mutation never suspends.
//! - `infrastructure` owns every socket, listener and outbound HTTP call.

/// Domain layer: configuration and validated command types (no I/O).
pub mod domain;

/// Application layer: connection registry and message routing.
pub mod application;

/// Infrastructure layer: TCP listener, HTTP bridge, webhook, config file.
pub mod infrastructure;
