use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use graft_session::{Message, SessionId, Value};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    kind: &'static str,
    session: Option<&'a str>,
    channel: Option<u32>,
    fields: serde_json::Value,
    timestamp: String,
}

#[derive(Serialize)]
struct ChunkOutput<'a> {
    kind: &'static str,
    session: &'a str,
    channel_id: u32,
    value: serde_json::Value,
    timestamp: String,
}

pub fn print_message(message: &Message, format: OutputFormat) {
    let session = message.session().map(SessionId::as_str);
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                kind: "message",
                session,
                channel: message.channel(),
                fields: fields_json(message),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (key, value) in message.fields() {
                table.add_row(vec![key.clone(), value_preview(value)]);
            }
            println!(
                "session={} channel={}",
                session.unwrap_or("-"),
                message.channel().unwrap_or_default()
            );
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "message session={} channel={} fields={}",
                session.unwrap_or("-"),
                message.channel().unwrap_or_default(),
                fields_json(message)
            );
        }
        OutputFormat::Raw => {
            print_raw(fields_json(message).to_string().as_bytes());
            print_raw(b"\n");
        }
    }
}

pub fn print_chunk(session: &SessionId, channel_id: u32, value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ChunkOutput {
                kind: "chunk",
                session: session.as_str(),
                channel_id,
                value: value.to_json(),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "chunk session={} channel={} value={}",
                session,
                channel_id,
                value_preview(value)
            );
        }
        // Raw output reassembles streamed payloads byte for byte.
        OutputFormat::Raw => match value {
            Value::Bytes(bytes) => print_raw(bytes),
            Value::String(text) => print_raw(text.as_bytes()),
            other => {
                print_raw(other.to_json().to_string().as_bytes());
                print_raw(b"\n");
            }
        },
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(out: &T) {
    println!(
        "{}",
        serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
    );
}

fn fields_json(message: &Message) -> serde_json::Value {
    serde_json::Value::Object(
        message
            .fields()
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

pub fn value_preview(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => format!("<binary {} bytes>", bytes.len()),
        },
        Value::Channel(channel) => format!("<channel {} {}>", channel.id(), channel.direction().as_str()),
        other => other.to_json().to_string(),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
