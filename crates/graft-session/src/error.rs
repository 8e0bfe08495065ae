/// Failure of a single channel, as seen by that channel's consumer.
///
/// Cloneable so one failure can be delivered to every reader that observes it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The writing side reported an error through the channel.
    #[error("channel failed: {0}")]
    Failed(String),

    /// The session carrying the channel went away before the channel ended.
    #[error("channel terminated: {0}")]
    Terminated(String),
}

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session was closed, locally or by its transport.
    #[error("session closed")]
    SessionClosed,

    /// The channel no longer accepts writes in this direction.
    #[error("channel {0} closed")]
    ChannelClosed(u32),

    /// A frame referenced a channel this session does not know.
    #[error("unknown channel {0}")]
    UnknownChannel(u32),

    /// A channel-level failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] graft_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] graft_frame::FrameError),

    /// The peer sent something that is not a valid graft frame or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Every channel ID this session can allocate has been used.
    #[error("channel ids exhausted")]
    ChannelIdsExhausted,

    /// The channel belongs to another session and cannot be embedded here.
    #[error("channel {0} is bound to a different session")]
    ForeignChannel(u32),
}

impl SessionError {
    /// True for errors that end the whole session rather than one operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Transport(_) | SessionError::Frame(_) | SessionError::Protocol(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
