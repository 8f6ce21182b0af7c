//! Relay configuration types.
//!
//! [`RelayConfig`] is the single source of truth for runtime settings.  It is
//! a plain struct: nothing in the core reads environment variables or files.
//! `main.rs` fills it from CLI flags and the optional TOML file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bus_core::DEFAULT_MAX_FRAME_LEN;

/// Default TCP port for bus clients.
pub const DEFAULT_BUS_PORT: u16 = 8082;

/// The HTTP API listens this many ports above the bus port unless told otherwise.
pub const API_PORT_OFFSET: u16 = 1000;

/// Default ceiling on bytes queued for one connection before it is evicted.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Default bound on a single webhook call.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default period of the "clients connected" log line.
pub const DEFAULT_CONNECTION_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound webhook settings.  No URL means the feature is switched off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: DEFAULT_WEBHOOK_TIMEOUT,
        }
    }
}

impl WebhookConfig {
    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

/// All runtime configuration for the relay.
///
/// # Example
///
/// ```rust
/// use bus_relay::domain::RelayConfig;
///
/// let cfg = RelayConfig::default();
/// assert_eq!(cfg.bus_addr().port(), 8082);
/// assert_eq!(cfg.api_addr().port(), 9082);
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface both listeners bind to.
    pub bind_host: IpAddr,

    /// TCP port for bus clients.  `0` lets the OS choose (tests).
    pub bus_port: u16,

    /// TCP port for the HTTP bridge.  `0` lets the OS choose (tests).
    pub api_port: u16,

    pub webhook: WebhookConfig,

    /// Largest frame accepted from or sent to a client.
    pub max_frame_len: usize,

    /// Outbound queue ceiling per connection.  A connection whose unsent
    /// bytes would exceed this is force-closed as a slow consumer.
    pub max_pending_bytes: usize,

    pub connection_log_interval: Duration,

    /// Logging only; has no effect on relay behaviour.
    pub verbose: bool,
}

impl Default for RelayConfig {
    /// | Field                   | Default        |
    /// |-------------------------|----------------|
    /// | bind_host               | `127.0.0.1`    |
    /// | bus_port                | `8082`         |
    /// | api_port                | `9082`         |
    /// | webhook.url             | none           |
    /// | webhook.timeout         | 10 seconds     |
    /// | max_frame_len           | 1 MiB          |
    /// | max_pending_bytes       | 4 MiB          |
    /// | connection_log_interval | 30 seconds     |
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bus_port: DEFAULT_BUS_PORT,
            api_port: DEFAULT_BUS_PORT + API_PORT_OFFSET,
            webhook: WebhookConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            connection_log_interval: DEFAULT_CONNECTION_LOG_INTERVAL,
            verbose: false,
        }
    }
}

impl RelayConfig {
    pub fn bus_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.bus_port)
    }

    pub fn api_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.api_port)
    }

    /// Both listeners on an OS-assigned loopback port.  Used by tests so
    /// several relays can run side by side.
    pub fn ephemeral() -> Self {
        Self {
            bus_port: 0,
            api_port: 0,
            ..Self::default()
        }
    }
}

/// Computes the API port from the bus port.
///
/// An ephemeral bus port (`0`) yields an ephemeral API port.  Returns `None`
/// when the offset would overflow the port range.
pub fn derive_api_port(bus_port: u16) -> Option<u16> {
    if bus_port == 0 {
        return Some(0);
    }
    bus_port.checked_add(API_PORT_OFFSET)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
