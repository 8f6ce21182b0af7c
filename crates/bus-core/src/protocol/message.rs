//! The bus message envelope and protocol constants.
//!
//! A [`Message`] is deliberately shape-agnostic: the relay forwards ordinary
//! client traffic without interpreting it, so the envelope is just a name and
//! an ordered list of string pairs.  Only a handful of system messages (see
//! [`names`]) carry meaning for the server itself.

// ── Protocol constants ────────────────────────────────────────────────────────

/// Size of every length field on the wire (`u32`, big-endian).
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Smallest possible frame: total length + name length + pair count.
///
/// A frame this small has an empty name, so it is never *valid*, but any
/// declared length below it cannot even be parsed.
pub const MIN_FRAME_LEN: usize = 3 * LENGTH_FIELD_SIZE;

/// Default upper bound on a single frame, including its length prefix.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Names of the system messages the relay itself understands.
pub mod names {
    /// Server greeting on accept (`yourID`), and client identification
    /// (`userAgent`, `privateOnly`).
    pub const HELLO: &str = "HELLO";
    /// Request/reply listing the identified clients.
    pub const LIST_CLIENTS: &str = "LIST_CLIENTS";
    /// Announces a newly identified client to the others.
    pub const JOIN: &str = "JOIN";
    /// Announces that an identified client went away.
    pub const LEAVE: &str = "LEAVE";
}

// ── Message ───────────────────────────────────────────────────────────────────

/// One bus message: a non-empty name plus ordered string key/value pairs.
///
/// Pair order is preserved exactly as sent, and duplicate keys are kept, so
/// a decoded message re-encodes to the identical byte sequence.
///
/// # Examples
///
/// ```rust
/// use bus_core::Message;
///
/// let msg = Message::new("busComm")
///     .with_arg("player", "all")
///     .with_arg("comm", "where");
/// assert_eq!(msg.arg("comm"), Some("where"));
/// assert!(msg.is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub name: String,
    pub args: Vec<(String, String)>,
}

impl Message {
    /// Creates a message with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Builder-style variant of [`Message::push_arg`].
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_arg(key, value);
        self
    }

    /// Appends one key/value pair, keeping any earlier pair with the same key.
    pub fn push_arg(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.args.push((key.into(), value.into()));
    }

    /// Returns the value of the first pair named `key`.
    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// A message with an empty name cannot be put on the wire.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
    }

    /// Exact size of this message once framed, including the length prefix.
    pub fn encoded_len(&self) -> usize {
        let pairs: usize = self
            .args
            .iter()
            .map(|(k, v)| 2 * LENGTH_FIELD_SIZE + k.len() + v.len())
            .sum();
        MIN_FRAME_LEN + self.name.len() + pairs
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
