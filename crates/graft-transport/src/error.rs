use std::path::PathBuf;

/// Failures raised while opening or driving a byte-stream carrier.
///
/// In-process pipes only ever produce [`TransportError::Io`]; the other
/// variants come from Unix socket setup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listener socket could not be created at `path`.
    #[error("cannot listen on {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No listener answered at `path`.
    #[error("cannot reach {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("accept: {0}")]
    Accept(std::io::Error),

    /// Reading or writing the established stream failed.
    #[error("stream i/o: {0}")]
    Io(#[from] std::io::Error),

    /// `sun_path` cannot hold `path`.
    #[error("{path} is {len} bytes, sockets allow at most {max}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
