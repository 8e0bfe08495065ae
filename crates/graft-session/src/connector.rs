use std::path::Path;

use graft_transport::UnixDomainSocket;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::Session;

/// Connect to a listening session over a Unix domain socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<Session> {
    connect_with_config(path, SessionConfig::default()).await
}

/// Connect with explicit session configuration.
pub async fn connect_with_config(path: impl AsRef<Path>, config: SessionConfig) -> Result<Session> {
    let stream = UnixDomainSocket::connect(path).await?;
    Ok(Session::with_config(stream, config))
}
