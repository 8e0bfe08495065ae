use std::fs;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use graft_session::{connect, Message, Session, Value};
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{io_error, session_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    if args.chunk_size == 0 {
        return Err(CliError::new(USAGE, "--chunk-size must be greater than zero"));
    }
    let mut message = resolve_message(&args)?;
    let attachment = match &args.attach_file {
        Some(path) => Some(read_file(path)?),
        None => None,
    };

    let session = connect(&args.path)
        .await
        .map_err(|err| session_error("connect failed", err))?;

    let channel = match attachment {
        Some(_) => {
            let channel = session
                .create_write_channel()
                .map_err(|err| session_error("channel setup failed", err))?;
            message.insert("attachment", channel.clone());
            Some(channel)
        }
        None => None,
    };

    session
        .write(message)
        .await
        .map_err(|err| session_error("send failed", err))?;

    if let (Some(channel), Some(data)) = (channel, attachment) {
        let chunks = data.len().div_ceil(args.chunk_size);
        for chunk in split_chunks(data, args.chunk_size) {
            channel
                .send(chunk)
                .await
                .map_err(|err| session_error("attachment send failed", err))?;
        }
        channel
            .end()
            .await
            .map_err(|err| session_error("attachment send failed", err))?;
        debug!(channel_id = channel.id(), chunks, "attachment queued");
    }

    if args.wait {
        let reply = wait_for_reply(&session, wait_timeout).await;
        close(&session).await?;
        print_message(&reply?, format);
        return Ok(SUCCESS);
    }

    close(&session).await?;
    Ok(SUCCESS)
}

async fn close(session: &Session) -> CliResult<()> {
    session
        .close()
        .await
        .map_err(|err| session_error("close failed", err))
}

async fn wait_for_reply(session: &Session, timeout: Duration) -> CliResult<Message> {
    match tokio::time::timeout(timeout, session.recv()).await {
        Ok(Ok(Some(message))) => Ok(message),
        Ok(Ok(None)) => Err(CliError::new(
            FAILURE,
            "session closed before a reply arrived",
        )),
        Ok(Err(err)) => Err(session_error("receive failed", err)),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no reply within {}ms", timeout.as_millis()),
        )),
    }
}

fn resolve_message(args: &SendArgs) -> CliResult<Message> {
    if let Some(json) = &args.json {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Message::try_from(parsed)
            .map_err(|_| CliError::new(USAGE, "--json must be a JSON object"));
    }
    if let Some(data) = &args.data {
        return Ok(Message::new().with("data", data.as_str()));
    }
    if let Some(path) = &args.file {
        return Ok(Message::new().with("data", Bytes::from(read_file(path)?)));
    }
    Ok(Message::new())
}

fn read_file(path: &Path) -> CliResult<Vec<u8>> {
    fs::read(path).map_err(|err| io_error(&format!("failed reading {}", path.display()), err))
}

fn split_chunks(data: Vec<u8>, size: usize) -> Vec<Value> {
    let data = Bytes::from(data);
    (0..data.len())
        .step_by(size)
        .map(|start| Value::from(data.slice(start..data.len().min(start + size))))
        .collect()
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
