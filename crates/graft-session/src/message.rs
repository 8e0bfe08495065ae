use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::value::Value;

/// Opaque identifier of a session, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where a message entered the graft network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// The session that first emitted the message.
    pub session: SessionId,
    /// The channel the message arrived on in that session.
    pub channel: u32,
}

/// A set of named fields plus the identity of where it came from.
///
/// The origin metadata is attached when a session emits the message and is
/// kept separate from the fields, so user data can never overwrite it.
#[derive(Debug, Default, PartialEq)]
pub struct Message {
    fields: BTreeMap<String, Value>,
    provenance: Option<Provenance>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    /// Originating session, set once the message has been emitted by a session.
    pub fn session(&self) -> Option<&SessionId> {
        self.provenance.as_ref().map(|p| &p.session)
    }

    /// Originating channel, set once the message has been emitted by a session.
    pub fn channel(&self) -> Option<u32> {
        self.provenance.as_ref().map(|p| p.channel)
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    /// Render fields and metadata as JSON for display.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();
        if let Some(provenance) = &self.provenance {
            out.insert(
                "_session".to_string(),
                serde_json::Value::String(provenance.session.to_string()),
            );
            out.insert("_channel".to_string(), provenance.channel.into());
        }
        serde_json::Value::Object(out)
    }

    pub(crate) fn from_parts(fields: BTreeMap<String, Value>, provenance: Provenance) -> Self {
        Self {
            fields,
            provenance: Some(provenance),
        }
    }

    pub(crate) fn stamp(&mut self, provenance: Provenance) {
        self.provenance = Some(provenance);
    }

    /// Keep existing metadata; otherwise attribute the message to `default`.
    pub(crate) fn stamp_if_missing(&mut self, default: impl FnOnce() -> Provenance) {
        if self.provenance.is_none() {
            self.provenance = Some(default());
        }
    }
}

impl From<BTreeMap<String, Value>> for Message {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields,
            provenance: None,
        }
    }
}

/// A message becomes a map value; its origin metadata stays behind.
impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Map(message.fields)
    }
}

impl TryFrom<Value> for Message {
    type Error = SessionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Map(fields) => Ok(Message::from(fields)),
            other => Err(SessionError::Protocol(format!(
                "expected a map for a message, got {other:?}"
            ))),
        }
    }
}

impl TryFrom<serde_json::Value> for Message {
    type Error = SessionError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Message::try_from(Value::from(value))
    }
}
