use graft_session::{Channel, Session, SessionId, SessionListener};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cmd::{readable_channels, ListenArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_chunk, print_message, OutputFormat};

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let listener =
        SessionListener::bind(&args.path).map_err(|err| session_error("bind failed", err))?;
    info!(path = %listener.path().display(), "listening");

    let mut printed = 0usize;

    loop {
        let session = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(SUCCESS),
            accepted = listener.accept() => {
                accepted.map_err(|err| session_error("accept failed", err))?
            }
        };
        info!(session = %session.id(), "session accepted");

        let mut drains = Vec::new();
        loop {
            let next = tokio::select! {
                _ = tokio::signal::ctrl_c() => None,
                next = session.recv() => Some(next),
            };
            let Some(next) = next else {
                finish(session, drains).await;
                return Ok(SUCCESS);
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) => {
                    finish(session, drains).await;
                    return Err(session_error("receive failed", err));
                }
            };

            print_message(&message, format);
            for channel in readable_channels(&message) {
                drains.push(tokio::spawn(drain(channel, session.id().clone(), format)));
            }
            printed = printed.saturating_add(1);

            if let Some(count) = args.count {
                if printed >= count {
                    finish(session, drains).await;
                    return Ok(SUCCESS);
                }
            }
        }

        debug!(session = %session.id(), "session ended");
        finish(session, drains).await;
    }
}

/// Print every chunk of an embedded channel until it ends.
async fn drain(channel: Channel, session: SessionId, format: OutputFormat) {
    while let Some(item) = channel.recv().await {
        match item {
            Ok(value) => print_chunk(&session, channel.id(), &value, format),
            Err(err) => {
                warn!(session = %session, channel_id = channel.id(), %err, "channel failed");
                return;
            }
        }
    }
    debug!(session = %session, channel_id = channel.id(), "channel ended");
}

/// Let embedded channels run to their end, then close the session.
async fn finish(session: Session, drains: Vec<JoinHandle<()>>) {
    let all = async {
        for drain in drains {
            let _ = drain.await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = all => {}
    }
    if let Err(err) = session.close().await {
        debug!(%err, "session close failed");
    }
}
