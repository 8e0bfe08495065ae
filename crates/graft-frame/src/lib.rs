//! Length-prefixed frame codec with channel routing.
//!
//! Every frame on a graft link carries:
//! - A 2-byte magic number ("GF") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 1-byte frame kind (message, data, control)
//! - A 1-byte flag set (which side allocated the channel id)
//! - A 4-byte little-endian channel ID
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed`, so callers only ever
//! see complete frames.

pub mod channel;
pub mod codec;
pub mod error;

pub use channel::{channel_name, is_root, Origin, ROOT, USER_CHANNEL_START};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, FrameKind, DEFAULT_MAX_PAYLOAD,
    FLAG_RECEIVER_ORIGIN, HEADER_SIZE, MAGIC,
};
pub use error::{FrameError, Result};
