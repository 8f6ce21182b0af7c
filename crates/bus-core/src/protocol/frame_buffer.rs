//! Per-connection reassembly of frames from partial reads.

use tracing::debug;

use crate::protocol::codec::{decode_message_with_limit, ProtocolError};
use crate::protocol::message::{Message, DEFAULT_MAX_FRAME_LEN};

/// Accumulates raw bytes from a stream and yields complete [`Message`]s.
///
/// TCP delivers bytes with arbitrary boundaries: one read may hold half a
/// frame or three frames.  Feed every read into [`FrameBuffer::extend`] and
/// drain with [`FrameBuffer::next_message`] until it returns `Ok(None)`.
///
/// Any error other than "need more data" is fatal for the stream: the frame
/// boundary is lost and the buffer must not be used again.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, or `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::FrameTooLarge`] or [`ProtocolError::Malformed`] when the
    /// buffered bytes can never form a valid frame.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match decode_message_with_limit(&self.buf, self.max_frame_len) {
            Ok((msg, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(msg))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => {
                debug!(buffered = self.buf.len(), error = %e, "frame rejected");
                Err(e)
            }
        }
    }

    /// Number of buffered bytes not yet consumed as a frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
