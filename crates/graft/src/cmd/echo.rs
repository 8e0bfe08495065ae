use graft_session::{Session, SessionListener};
use tracing::{debug, info, warn};

use crate::cmd::EchoArgs;
use crate::exit::{session_error, CliResult, SUCCESS};

pub async fn run(args: EchoArgs) -> CliResult<i32> {
    let listener =
        SessionListener::bind(&args.path).map_err(|err| session_error("bind failed", err))?;
    info!(path = %listener.path().display(), "echo server listening");

    loop {
        let session = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(SUCCESS),
            accepted = listener.accept() => {
                accepted.map_err(|err| session_error("accept failed", err))?
            }
        };
        info!(session = %session.id(), "session accepted");
        tokio::spawn(echo_session(session));
    }
}

/// Write every message back. Embedded channels resolve to the peer's own
/// handles on the way back.
async fn echo_session(session: Session) {
    let mut echoed = 0u64;
    loop {
        let message = match session.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                warn!(session = %session.id(), %err, "session failed");
                break;
            }
        };
        debug!(session = %session.id(), fields = message.len(), "echoing message");
        if let Err(err) = session.write(message).await {
            warn!(session = %session.id(), %err, "echo failed");
            break;
        }
        echoed += 1;
    }
    info!(session = %session.id(), echoed, "session ended");
    if let Err(err) = session.close().await {
        debug!(%err, "session close failed");
    }
}
