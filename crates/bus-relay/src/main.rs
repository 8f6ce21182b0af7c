//! bus-relay: message bus relay with an HTTP command bridge.
//!
//! Bus clients connect over TCP and exchange length-prefixed frames; every
//! frame a client sends is relayed to all other connected clients.  A small
//! HTTP API lets outside tools inject commands onto the bus or divert them
//! to a chat webhook.
//!
//! # Usage
//!
//! ```text
//! bus-relay [OPTIONS]
//!
//! Options:
//!   --bind <IP>                 Interface for both listeners [default: 127.0.0.1]
//!   --port <PORT>               Bus TCP port [default: 8082]
//!   --api-port <PORT>           HTTP API port [default: bus port + 1000]
//!   --webhook-url <URL>         Webhook for `player=discord` commands
//!   --webhook-timeout <SECS>    Webhook request timeout [default: 10]
//!   --max-pending-bytes <N>     Per-client outbound queue ceiling
//!   --config <PATH>             Optional TOML configuration file
//!   -v, --verbose               Debug logging
//!   -q, --quiet                 Warnings and errors only
//! ```
//!
//! # Precedence
//!
//! Built-in defaults, then the `--config` file, then environment variables
//! and flags.  `RUST_LOG` overrides `--verbose`/`--quiet` when set.
//!
//! | Variable              | Flag                |
//! |-----------------------|---------------------|
//! | `BUS_BIND`            | `--bind`            |
//! | `BUS_PORT`            | `--port`            |
//! | `BUS_API_PORT`        | `--api-port`        |
//! | `BUS_WEBHOOK_URL`     | `--webhook-url`     |
//! | `BUS_WEBHOOK_TIMEOUT` | `--webhook-timeout` |
//! | `BUS_CONFIG`          | `--config`          |

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bus_relay::domain::{derive_api_port, RelayConfig};
use bus_relay::infrastructure::storage::load_config;
use bus_relay::infrastructure::RelayServer;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Message bus relay with an HTTP command bridge.
#[derive(Debug, Parser)]
#[command(name = "bus-relay", about = "TCP message bus relay with an HTTP command bridge", version)]
struct Cli {
    /// Interface both listeners bind to.  Use `0.0.0.0` for LAN access.
    #[arg(long, env = "BUS_BIND")]
    bind: Option<String>,

    /// TCP port for bus clients.
    #[arg(long, env = "BUS_PORT")]
    port: Option<u16>,

    /// TCP port for the HTTP API.  Defaults to the bus port plus 1000.
    #[arg(long, env = "BUS_API_PORT")]
    api_port: Option<u16>,

    /// Webhook URL that receives `player=discord` commands.
    #[arg(long, env = "BUS_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Webhook request timeout in seconds.
    #[arg(long, env = "BUS_WEBHOOK_TIMEOUT")]
    webhook_timeout: Option<u64>,

    /// Bytes that may queue for one client before it is dropped.
    #[arg(long)]
    max_pending_bytes: Option<usize>,

    /// Optional TOML configuration file.
    #[arg(long, env = "BUS_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level (per-message traffic).
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Log warnings and errors only.
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    /// Resolves defaults, the config file, and flags into a [`RelayConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or is invalid, if
    /// `--bind` is not an IP address, if the derived API port overflows, or
    /// if a limit or timeout is zero.
    fn into_relay_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = RelayConfig::default();

        if let Some(path) = &self.config {
            let file = load_config(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?;
            file.apply_to(&mut config)
                .with_context(|| format!("invalid config file {}", path.display()))?;
        }

        if let Some(bind) = &self.bind {
            config.bind_host = bind
                .parse::<IpAddr>()
                .with_context(|| format!("invalid bind address: '{bind}'"))?;
        }
        if let Some(port) = self.port {
            config.bus_port = port;
        }
        match (self.api_port, self.port) {
            (Some(api_port), _) => config.api_port = api_port,
            (None, Some(port)) => {
                config.api_port = derive_api_port(port).with_context(|| {
                    format!("bus port {port} leaves no room for the API port; pass --api-port")
                })?;
            }
            (None, None) => {}
        }
        if let Some(url) = self.webhook_url {
            config.webhook.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(secs) = self.webhook_timeout {
            anyhow::ensure!(secs > 0, "--webhook-timeout must be greater than zero");
            config.webhook.timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.max_pending_bytes {
            anyhow::ensure!(bytes > 0, "--max-pending-bytes must be greater than zero");
            config.max_pending_bytes = bytes;
        }
        if self.verbose {
            config.verbose = true;
        }
        if self.quiet {
            config.verbose = false;
        }

        Ok(config)
    }
}

/// Default filter when `RUST_LOG` is unset.
fn default_log_level(quiet: bool, config: &RelayConfig) -> &'static str {
    if quiet {
        "warn"
    } else if config.verbose {
        "debug"
    } else {
        "info"
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let quiet = cli.quiet;
    let config = cli.into_relay_config()?;
    let level = default_log_level(quiet, &config);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!(
        "bus relay starting: bus={}, api={}, webhook={}",
        config.bus_addr(),
        config.api_addr(),
        if config.webhook.is_enabled() { "on" } else { "off" }
    );

    let server = RelayServer::bind(config).await?;
    let running = server.running_flag();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    server.run().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["bus-relay"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults_match_relay_config_defaults() {
        // Arrange
        let cli = Cli {
            bind: None,
            port: None,
            api_port: None,
            webhook_url: None,
            webhook_timeout: None,
            max_pending_bytes: None,
            config: None,
            verbose: false,
            quiet: false,
        };

        // Act
        let config = cli.into_relay_config().unwrap();

        // Assert
        assert_eq!(config.bus_port, 8082);
        assert_eq!(config.api_port, 9082);
        assert_eq!(config.bind_host.to_string(), "127.0.0.1");
        assert!(!config.webhook.is_enabled());
    }

    #[test]
    fn test_port_flag_moves_api_port() {
        let config = cli(&["--port", "7000"]).into_relay_config().unwrap();
        assert_eq!(config.bus_port, 7000);
        assert_eq!(config.api_port, 8000);
    }

    #[test]
    fn test_api_port_flag_wins() {
        let config = cli(&["--port", "7000", "--api-port", "7001"])
            .into_relay_config()
            .unwrap();
        assert_eq!(config.api_port, 7001);
    }

    #[test]
    fn test_high_port_without_api_port_is_error() {
        let result = cli(&["--port", "65000"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_bind_is_error() {
        let result = cli(&["--bind", "not.an.ip"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_webhook_flags() {
        let config = cli(&["--webhook-url", "http://hooks.local/x", "--webhook-timeout", "3"])
            .into_relay_config()
            .unwrap();
        assert_eq!(config.webhook.url.as_deref(), Some("http://hooks.local/x"));
        assert_eq!(config.webhook.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_high_port_with_explicit_api_port_is_accepted() {
        // Arrange
        let cli = cli(&["--port", "65000", "--api-port", "65001"]);

        // Act
        let config = cli.into_relay_config().unwrap();

        // Assert
        assert_eq!(config.bus_port, 65000);
        assert_eq!(config.api_port, 65001);
    }

    #[test]
    fn test_zero_webhook_timeout_is_error() {
        let result = cli(&["--webhook-timeout", "0"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_max_pending_bytes_is_error() {
        let result = cli(&["--max-pending-bytes", "0"]).into_relay_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        // Arrange
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bus]\nport = 6000\n\n[webhook]\nurl = \"http://from-file\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        // Act
        let config = cli(&["--config", &path, "--port", "6100"])
            .into_relay_config()
            .unwrap();

        // Assert
        assert_eq!(config.bus_port, 6100);
        assert_eq!(config.api_port, 7100);
        assert_eq!(config.webhook.url.as_deref(), Some("http://from-file"));
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let result = cli(&["--config", path.to_str().unwrap()]).into_relay_config();
        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("nope.toml"));
    }

    #[test]
    fn test_verbose_and_quiet_set_log_level() {
        let verbose = cli(&["-v"]).into_relay_config().unwrap();
        assert_eq!(default_log_level(false, &verbose), "debug");

        let quiet = cli(&["-q"]).into_relay_config().unwrap();
        assert_eq!(default_log_level(true, &quiet), "warn");
        assert_eq!(default_log_level(false, &RelayConfig::default()), "info");
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["bus-relay", "-v", "-q"]);
        assert!(result.is_err());
    }
}
