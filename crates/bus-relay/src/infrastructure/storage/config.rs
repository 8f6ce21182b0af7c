//! Optional TOML configuration file.
//!
//! Every field is optional: a value present in the file overrides the
//! built-in default, and a flag given on the command line overrides the file.
//!
//! ```toml
//! [bus]
//! bind = "0.0.0.0"
//! port = 8082
//! api_port = 9082
//! max_frame_len = 1048576
//! max_pending_bytes = 4194304
//!
//! [webhook]
//! url = "https://discord.com/api/webhooks/..."
//! timeout_secs = 10
//!
//! [logging]
//! verbose = false
//! connection_log_secs = 30
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{derive_api_port, RelayConfig};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub webhook: WebhookSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BusSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
    /// Defaults to `port + 1000`.
    pub api_port: Option<u16>,
    pub max_frame_len: Option<usize>,
    pub max_pending_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WebhookSection {
    pub url: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub verbose: Option<bool>,
    pub connection_log_secs: Option<u64>,
}

impl FileConfig {
    /// Overlays every value present in the file onto `config`.
    ///
    /// When the file sets `port` but not `api_port`, the API port is derived
    /// from the new bus port.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] for an unparsable bind address, a derived
    /// API port that would overflow, or a zero limit or timeout.
    pub fn apply_to(&self, config: &mut RelayConfig) -> Result<(), ConfigError> {
        if let Some(bind) = &self.bus.bind {
            config.bind_host = bind.parse::<IpAddr>().map_err(|_| ConfigError::InvalidValue {
                field: "bus.bind",
                value: bind.clone(),
            })?;
        }
        if let Some(port) = self.bus.port {
            config.bus_port = port;
        }
        match (self.bus.api_port, self.bus.port) {
            (Some(api_port), _) => config.api_port = api_port,
            (None, Some(port)) => {
                config.api_port = derive_api_port(port).ok_or(ConfigError::InvalidValue {
                    field: "bus.port",
                    value: port.to_string(),
                })?;
            }
            (None, None) => {}
        }
        if let Some(len) = self.bus.max_frame_len {
            config.max_frame_len = non_zero("bus.max_frame_len", len)?;
        }
        if let Some(bytes) = self.bus.max_pending_bytes {
            config.max_pending_bytes = non_zero("bus.max_pending_bytes", bytes)?;
        }
        if let Some(url) = &self.webhook.url {
            config.webhook.url = Some(url.clone()).filter(|u| !u.trim().is_empty());
        }
        if let Some(secs) = self.webhook.timeout_secs {
            config.webhook.timeout = Duration::from_secs(non_zero("webhook.timeout_secs", secs)?);
        }
        if let Some(verbose) = self.logging.verbose {
            config.verbose = verbose;
        }
        if let Some(secs) = self.logging.connection_log_secs {
            config.connection_log_interval =
                Duration::from_secs(non_zero("logging.connection_log_secs", secs)?);
        }
        Ok(())
    }
}

fn non_zero<T>(field: &'static str, value: T) -> Result<T, ConfigError>
where
    T: Copy + Default + PartialEq + ToString,
{
    if value == T::default() {
        Err(ConfigError::InvalidValue {
            field,
            value: value.to_string(),
        })
    } else {
        Ok(value)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses configuration from TOML text.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML or unknown keys.
pub fn parse_config(content: &str) -> Result<FileConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Reads and parses the file at `path`.
///
/// The caller asked for this file explicitly, so a missing file is an error.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, [`ConfigError::Parse`]
/// if its content is invalid.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
