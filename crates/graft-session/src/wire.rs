//! JSON payload forms carried inside frames.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::Direction;
use crate::error::{Result, SessionError};
use crate::message::SessionId;

/// A value as it appears on the wire. Live handles are reduced to
/// [`ChannelRef`] placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub(crate) enum WireValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Channel(ChannelRef),
}

/// Placeholder for an embedded channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChannelRef {
    pub(crate) id: u32,
    /// True when the frame's receiver allocated `id`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub(crate) remote: bool,
    /// Direction as seen by the frame's sender.
    pub(crate) direction: Direction,
    /// Credit the sender grants for writes towards it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) window: Option<u32>,
}

/// Root-channel message payload.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) session: SessionId,
    pub(crate) channel: u32,
    pub(crate) body: BTreeMap<String, WireValue>,
}

pub(crate) fn to_payload<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub(crate) fn from_payload<'a, T: Deserialize<'a>>(payload: &'a [u8], what: &str) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|err| SessionError::Protocol(format!("invalid {what} payload: {err}")))
}
