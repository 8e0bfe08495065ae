use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex, ordered byte carrier a session can run over.
///
/// Readiness and drain signals come from `AsyncWrite` polling, end-of-stream
/// from a zero-length read, and failures from I/O errors. Framing is layered
/// on top by the session, so the carrier never sees frame boundaries.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
