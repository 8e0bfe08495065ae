use clap::{Args, Subcommand};
use std::path::PathBuf;

use graft_session::{Channel, Message, Value};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept sessions and write every message back.
    Echo(EchoArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Listen and print received messages and channel data.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Echo(args) => echo::run(args).await,
        Command::Send(args) => send::run(args, format).await,
        Command::Listen(args) => listen::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    /// Socket path to bind.
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// JSON object whose fields become the message.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Text sent as the `data` field.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// File whose bytes are sent as the `data` field.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Stream a file through an embedded `attachment` channel.
    #[arg(long, value_name = "PATH")]
    pub attach_file: Option<PathBuf>,
    /// Bytes per attachment chunk.
    #[arg(long, default_value = "65536", requires = "attach_file")]
    pub chunk_size: usize,
    /// Wait for one message back and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Channels in `message` this side can read from, depth first.
pub(crate) fn readable_channels(message: &Message) -> Vec<Channel> {
    let mut found = Vec::new();
    for value in message.fields().values() {
        collect_readable(value, &mut found);
    }
    found
}

fn collect_readable(value: &Value, found: &mut Vec<Channel>) {
    match value {
        Value::Channel(channel) if channel.direction().can_read() => found.push(channel.clone()),
        Value::Array(items) => items.iter().for_each(|item| collect_readable(item, found)),
        Value::Map(map) => map.values().for_each(|item| collect_readable(item, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use graft_session::Session;

    use super::*;

    #[tokio::test]
    async fn finds_nested_readable_channels() {
        let session = Session::local();
        let top = session.create_read_channel().unwrap();
        let nested = session.create_duplex_channel().unwrap();
        let outbound = session.create_write_channel().unwrap();

        let mut inner = std::collections::BTreeMap::new();
        inner.insert("deep".to_string(), Value::from(vec![Value::from(nested.clone())]));
        let message = Message::new()
            .with("top", top.clone())
            .with("inner", inner)
            .with("out", outbound);

        let found = readable_channels(&message);
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|c| c.ptr_eq(&top)));
        assert!(found.iter().any(|c| c.ptr_eq(&nested)));
    }
}
