use std::path::Path;

use graft_transport::UnixDomainSocket;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::Session;

/// Listens on a Unix domain socket and turns each connection into a [`Session`].
pub struct SessionListener {
    socket: UnixDomainSocket,
    session_config: SessionConfig,
}

impl SessionListener {
    /// Bind to a Unix domain socket path.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Self {
            socket,
            session_config: SessionConfig::default(),
        })
    }

    /// Override the configuration of accepted sessions.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Session> {
        let stream = self.socket.accept().await?;
        Ok(Session::with_config(stream, self.session_config.clone()))
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}
