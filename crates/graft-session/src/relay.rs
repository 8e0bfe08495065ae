use graft_frame::ROOT;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::session::Session;

/// A running forwarder from one session's output into another session.
///
/// Every forwarded message keeps the session and channel it originally came
/// from. Live channels inside it stay bound to the session that created
/// them, so a transport-bound target rejects them with
/// [`SessionError::ForeignChannel`] and the relay stops with that error.
#[derive(Debug)]
pub struct RelayHandle {
    task: JoinHandle<Result<u64>>,
}

impl RelayHandle {
    pub(crate) fn spawn(source: Session, target: Session) -> Self {
        let task = tokio::spawn(async move {
            let mut forwarded = 0u64;
            while let Some(message) = source.recv().await? {
                let (session, channel) = match message.provenance() {
                    Some(origin) => (origin.session.clone(), origin.channel),
                    None => (source.id().clone(), ROOT),
                };
                target.accept_relayed(session, channel, message).await?;
                forwarded += 1;
            }
            debug!(source = %source.id(), target = %target.id(), forwarded, "relay finished");
            Ok(forwarded)
        });
        Self { task }
    }

    /// Stop forwarding.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the source to close; returns how many messages were forwarded.
    ///
    /// An aborted relay reports [`SessionError::SessionClosed`].
    pub async fn join(self) -> Result<u64> {
        match self.task.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SessionError::SessionClosed),
        }
    }
}
