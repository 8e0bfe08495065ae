//! Channel ID conventions.
//!
//! Channel 0 is the session root: ordinary messages written to a session
//! travel on it. Embedded channels are numbered from 1 upward by whichever
//! side allocates them, so every frame also records that side ([`Origin`]).

/// Session-level messages.
pub const ROOT: u32 = 0;

/// First ID handed out for embedded channels.
pub const USER_CHANNEL_START: u32 = 1;

/// Which end of a link allocated a channel ID, relative to the frame's sender.
///
/// Both peers allocate IDs from the same numeric range, so `(origin, id)` is
/// the identity of a channel on the wire, not `id` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The sender of this frame allocated the ID.
    Sender,
    /// The receiver of this frame allocated the ID.
    Receiver,
}

impl Origin {
    /// The same channel seen from the other end of the link.
    pub fn flip(self) -> Self {
        match self {
            Origin::Sender => Origin::Receiver,
            Origin::Receiver => Origin::Sender,
        }
    }
}

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u32) -> &'static str {
    match id {
        ROOT => "ROOT",
        _ => "EMBEDDED",
    }
}

/// Returns true if the channel ID is the session root.
pub fn is_root(id: u32) -> bool {
    id == ROOT
}
