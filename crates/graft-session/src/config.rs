use std::time::Duration;

use graft_frame::FrameConfig;

/// Default number of unacknowledged data chunks a reader accepts per channel.
pub const DEFAULT_CHANNEL_WINDOW: u32 = 16;

/// Default depth of the queue feeding the transport writer.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default time `close` waits for ended channels to reach the peer.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session behavior configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Credit granted to the peer for each readable channel.
    pub channel_window: u32,
    /// Frames that may wait for the transport before writers suspend.
    pub outbound_queue: usize,
    /// How long `close` waits for the peer to take the rest of ended
    /// channels. Whatever is still undelivered then fails the channel.
    pub close_timeout: Duration,
    /// Frame codec limits.
    pub frame: FrameConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_window: DEFAULT_CHANNEL_WINDOW,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn window(&self) -> u32 {
        self.channel_window.max(1)
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.outbound_queue.max(1)
    }
}
