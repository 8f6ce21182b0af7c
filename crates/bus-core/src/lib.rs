//! # bus-core
//!
//! Shared library for the bus relay containing the wire protocol: the
//! message envelope, the length-prefixed frame codec, and a streaming frame
//! buffer that reassembles frames from partial TCP reads.
//!
//! This crate has zero dependencies on sockets, async runtimes, or HTTP.
//! The relay server and any bus client (including test stubs) share it.
//!
//! # Architecture overview
//!
//! The bus is a relay: long-lived automation clients connect over TCP and
//! exchange small named messages.  Every message on the wire is a *frame*:
//!
//! ```text
//! [total_len:4][name_len:4][name][pair_count:4]([key_len:4][key][value_len:4][value])*
//! ```
//!
//! - **`protocol::message`** – the [`Message`] envelope: a non-empty name plus
//!   an ordered list of string key/value pairs.
//! - **`protocol::codec`** – [`encode_message`] / [`decode_message`], with a
//!   hard cap on frame size.
//! - **`protocol::frame_buffer`** – [`FrameBuffer`], the per-connection decode
//!   buffer that is fed raw bytes and yields complete messages.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `bus_core::Message` instead of `bus_core::protocol::message::Message`.
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::frame_buffer::FrameBuffer;
pub use protocol::message::{Message, DEFAULT_MAX_FRAME_LEN};
