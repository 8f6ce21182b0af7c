//! Validated HTTP broadcast requests.
//!
//! The HTTP bridge accepts two loose strings, `player` and `comm`.  This
//! module turns them into a [`BroadcastRequest`] or a [`ValidationError`]
//! before anything touches the registry.

use std::fmt;
use std::str::FromStr;

use bus_core::Message;
use thiserror::Error;

/// Name of the envelope the bridge puts on the bus.
pub const COMMAND_ENVELOPE: &str = "busComm";

/// Rejection of an HTTP request before any routing happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("unknown target '{0}' (expected 'all' or 'discord')")]
    UnknownTarget(String),
}

/// Where a broadcast goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSelector {
    /// Every live bus connection.
    All,
    /// The outbound webhook; the bus is not touched.
    Discord,
}

impl TargetSelector {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetSelector::All => "all",
            TargetSelector::Discord => "discord",
        }
    }

    /// Parses an already-normalised selector.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "" => Err(ValidationError::MissingParameter("player")),
            "all" => Ok(TargetSelector::All),
            "discord" => Ok(TargetSelector::Discord),
            other => Err(ValidationError::UnknownTarget(other.to_string())),
        }
    }
}

impl FromStr for TargetSelector {
    type Err = ValidationError;

    /// Lenient form: trims and lower-cases before [`TargetSelector::parse`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(&s.trim().to_lowercase())
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalised, validated command ready for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub target: TargetSelector,
    pub command: String,
}

impl BroadcastRequest {
    /// Validates raw `player` / `comm` values.
    ///
    /// `player` is trimmed and lower-cased, `comm` is trimmed.  Either being
    /// absent or blank after trimming is a [`ValidationError::MissingParameter`].
    ///
    /// ```rust
    /// use bus_relay::domain::{BroadcastRequest, TargetSelector};
    ///
    /// let req = BroadcastRequest::new(Some(" ALL "), Some(" where ")).unwrap();
    /// assert_eq!(req.target, TargetSelector::All);
    /// assert_eq!(req.command, "where");
    /// ```
    pub fn new(player: Option<&str>, comm: Option<&str>) -> Result<Self, ValidationError> {
        let player = player.map(str::trim).unwrap_or_default();
        if player.is_empty() {
            return Err(ValidationError::MissingParameter("player"));
        }
        let command = comm.map(str::trim).unwrap_or_default();
        if command.is_empty() {
            return Err(ValidationError::MissingParameter("comm"));
        }
        let target = player.parse::<TargetSelector>()?;
        Ok(Self {
            target,
            command: command.to_string(),
        })
    }

    /// The bus envelope: `busComm { player, comm }`.
    pub fn to_message(&self) -> Message {
        Message::new(COMMAND_ENVELOPE)
            .with_arg("player", self.target.as_str())
            .with_arg("comm", self.command.as_str())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
