//! In-process pipes.

use tracing::trace;

/// Default number of bytes buffered in each direction of a [`pipe`].
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-process pipe.
pub type Pipe = tokio::io::DuplexStream;

/// Create a connected pair of in-process transports.
///
/// Bytes written to one end are read from the other. Writes suspend once
/// [`DEFAULT_PIPE_CAPACITY`] bytes are in flight, so the pair behaves like a
/// socket with a bounded send buffer.
pub fn pipe() -> (Pipe, Pipe) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Create a connected pair with an explicit per-direction buffer size.
pub fn pipe_with_capacity(capacity: usize) -> (Pipe, Pipe) {
    trace!(capacity, "creating in-process pipe");
    tokio::io::duplex(capacity.max(1))
}
