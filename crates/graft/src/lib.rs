//! Multiplexed streams with embeddable channels over a single connection.
//!
//! graft runs any number of flow-controlled channels over one byte stream and
//! lets messages carry live channels as ordinary fields. Sessions can be
//! chained, and every message keeps the identity of the session it came from.
//!
//! # Crate Structure
//!
//! - [`transport`]: byte-stream carriers (in-process pipes, Unix sockets)
//! - [`frame`]: length-prefixed frame codec with channel routing
//! - [`session`]: sessions, channels, embedding and relays

/// Re-export transport types.
pub mod transport {
    pub use graft_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use graft_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use graft_session::*;
}

pub use graft_session::{Channel, Direction, Message, Session, SessionError, Value};
