//! Protocol module containing the message envelope, the binary codec, and
//! the streaming frame buffer.

pub mod codec;
pub mod frame_buffer;
pub mod message;

pub use codec::{
    decode_message, decode_message_with_limit, encode_message, encode_message_with_limit,
    ProtocolError,
};
pub use frame_buffer::FrameBuffer;
pub use message::*;
