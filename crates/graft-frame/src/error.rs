/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4746 \"GF\")")]
    InvalidMagic,

    /// The frame header names a kind this codec does not know.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// The frame header carries flag bits this codec does not know.
    #[error("unknown frame flags {0:#04x}")]
    UnknownFlags(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True when the error means the peer sent bytes that are not a valid frame.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic
                | FrameError::UnknownKind(_)
                | FrameError::UnknownFlags(_)
                | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
