//! Byte-stream carriers for graft sessions.
//!
//! A session only needs an ordered, backpressure-aware duplex byte stream.
//! This crate names that contract ([`Transport`]) and ships two carriers:
//! - in-process pipes ([`pipe`])
//! - Unix domain sockets (Linux/macOS)
//!
//! Anything else implementing `AsyncRead + AsyncWrite` works unchanged.

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{pipe, pipe_with_capacity, Pipe, DEFAULT_PIPE_CAPACITY};
pub use traits::Transport;

#[cfg(unix)]
pub use uds::UnixDomainSocket;
