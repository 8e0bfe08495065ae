use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Payload of a control frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    /// The reader materialized the channel and grants its initial window.
    Open { window: u32 },
    /// The reader drained `amount` chunks; the writer may send that many more.
    Credit { amount: u32 },
    /// The writer will send no more data.
    End,
    /// The writer failed; no more data follows.
    Error { message: String },
}

impl ControlOp {
    /// Serialize into a frame payload.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| SessionError::Protocol(format!("invalid control payload: {err}")))
    }
}
