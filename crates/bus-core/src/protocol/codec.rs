//! Binary codec for encoding and decoding bus messages.
//!
//! Wire format:
//! ```text
//! [total_len:4][name_len:4][name:N][pair_count:4]
//!     ([key_len:4][key:K][value_len:4][value:V]) * pair_count
//! ```
//! All integers are big-endian `u32`.  `total_len` counts the whole frame,
//! including its own four bytes.  All strings are UTF-8.
//!
//! Decoding never panics on arbitrary input: the worst outcome is
//! [`ProtocolError::Malformed`] or [`ProtocolError::FrameTooLarge`].

use thiserror::Error;

use crate::protocol::message::{
    Message, DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_SIZE, MIN_FRAME_LEN,
};

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer does not yet hold a complete frame.  Not fatal: feed more
    /// bytes and try again.
    #[error("need more data: frame requires {needed} bytes, {available} buffered")]
    NeedMoreData { needed: usize, available: usize },

    /// The length prefix claims more than the configured maximum.
    #[error("frame of {declared} bytes exceeds the {max} byte limit")]
    FrameTooLarge { declared: usize, max: usize },

    /// The frame is complete but its contents are not a valid message.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Attempted to encode a message without a name.
    #[error("message name must not be empty")]
    EmptyName,
}

impl ProtocolError {
    /// `true` for [`ProtocolError::NeedMoreData`], the only recoverable outcome.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::NeedMoreData { .. })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Message`] into one frame, enforcing [`DEFAULT_MAX_FRAME_LEN`].
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyName`] for a nameless message and
/// [`ProtocolError::FrameTooLarge`] if the frame would exceed the limit.
///
/// # Examples
///
/// ```rust
/// use bus_core::{decode_message, encode_message, Message};
///
/// let msg = Message::new("HELLO").with_arg("yourID", "0");
/// let bytes = encode_message(&msg).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    encode_message_with_limit(msg, DEFAULT_MAX_FRAME_LEN)
}

/// Encodes a [`Message`] into one frame of at most `max_frame_len` bytes.
///
/// # Errors
///
/// See [`encode_message`].
pub fn encode_message_with_limit(
    msg: &Message,
    max_frame_len: usize,
) -> Result<Vec<u8>, ProtocolError> {
    if msg.name.is_empty() {
        return Err(ProtocolError::EmptyName);
    }

    let total = msg.encoded_len();
    let max = max_frame_len.min(u32::MAX as usize);
    if total > max {
        return Err(ProtocolError::FrameTooLarge {
            declared: total,
            max,
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_be_bytes());
    write_length_prefixed_string(&mut buf, &msg.name);
    buf.extend_from_slice(&(msg.args.len() as u32).to_be_bytes());
    for (key, value) in &msg.args {
        write_length_prefixed_string(&mut buf, key);
        write_length_prefixed_string(&mut buf, value);
    }

    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Decodes one [`Message`] from the beginning of `bytes`, enforcing
/// [`DEFAULT_MAX_FRAME_LEN`].
///
/// Returns the decoded message and the number of bytes consumed, so the
/// caller can advance their read cursor.
///
/// # Errors
///
/// - [`ProtocolError::NeedMoreData`] while the frame is still incomplete.
/// - [`ProtocolError::FrameTooLarge`] as soon as the length prefix exceeds
///   the limit.
/// - [`ProtocolError::Malformed`] for any structural violation.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    decode_message_with_limit(bytes, DEFAULT_MAX_FRAME_LEN)
}

/// Decodes one [`Message`] from the beginning of `bytes` with a custom limit.
///
/// # Errors
///
/// See [`decode_message`].
pub fn decode_message_with_limit(
    bytes: &[u8],
    max_frame_len: usize,
) -> Result<(Message, usize), ProtocolError> {
    let total = read_u32(bytes, 0).ok_or(ProtocolError::NeedMoreData {
        needed: LENGTH_FIELD_SIZE,
        available: bytes.len(),
    })? as usize;

    // Checked before waiting for the body so an oversized claim never makes
    // the caller buffer up to `total` bytes.
    if total > max_frame_len {
        return Err(ProtocolError::FrameTooLarge {
            declared: total,
            max: max_frame_len,
        });
    }
    if total < MIN_FRAME_LEN {
        return Err(ProtocolError::Malformed(format!(
            "declared length {total} is shorter than the {MIN_FRAME_LEN}-byte header"
        )));
    }
    if bytes.len() < total {
        return Err(ProtocolError::NeedMoreData {
            needed: total,
            available: bytes.len(),
        });
    }

    let frame = &bytes[..total];
    let (name, mut off) = read_length_prefixed_string(frame, LENGTH_FIELD_SIZE, "name")?;
    if name.is_empty() {
        return Err(ProtocolError::Malformed("empty message name".to_string()));
    }

    let pair_count = read_u32(frame, off)
        .ok_or_else(|| ProtocolError::Malformed(format!("pair count overruns frame at {off}")))?
        as usize;
    off += LENGTH_FIELD_SIZE;

    // Every pair needs at least its two length fields; reject impossible
    // counts before allocating for them.
    let remaining = total - off;
    if pair_count > remaining / (2 * LENGTH_FIELD_SIZE) {
        return Err(ProtocolError::Malformed(format!(
            "{pair_count} pairs cannot fit in the remaining {remaining} bytes"
        )));
    }

    let mut args = Vec::with_capacity(pair_count);
    for _ in 0..pair_count {
        let (key, key_end) = read_length_prefixed_string(frame, off, "key")?;
        let (value, value_end) = read_length_prefixed_string(frame, key_end, "value")?;
        args.push((key, value));
        off = value_end;
    }

    if off != total {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after last pair",
            total - off
        )));
    }

    Ok((Message { name, args }, total))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(LENGTH_FIELD_SIZE)?;
    let bytes = buf.get(offset..end)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Writes a 4-byte length prefix followed by the UTF-8 string bytes.
///
/// Callers bound the frame size first, so the length always fits in `u32`.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Reads a 4-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(
    frame: &[u8],
    offset: usize,
    context: &str,
) -> Result<(String, usize), ProtocolError> {
    let len = read_u32(frame, offset).ok_or_else(|| {
        ProtocolError::Malformed(format!("{context} length overruns frame at {offset}"))
    })? as usize;
    let start = offset + LENGTH_FIELD_SIZE;
    if len > frame.len() - start {
        return Err(ProtocolError::Malformed(format!(
            "{context} of length {len} at offset {start} exceeds frame"
        )));
    }
    let s = std::str::from_utf8(&frame[start..start + len])
        .map_err(|e| ProtocolError::Malformed(format!("{context} is not valid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
