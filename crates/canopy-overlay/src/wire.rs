//! Wire envelope: one JSON object per frame.
//!
//! ```text
//! {"type": "DATA", "data": <opaque>}
//! {"type": "JOIN-REQUEST", "origin": "<8 hex chars>", "signal": <opaque>}
//! ```
//!
//! Any other `type` is a protocol violation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::JoinRequest;

/// The two message kinds multiplexed over a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Opaque application payload.
    #[serde(rename = "DATA")]
    Data { data: serde_json::Value },

    /// A join request forwarded verbatim.
    #[serde(rename = "JOIN-REQUEST")]
    JoinRequest(JoinRequest),
}

/// Header-only view used to tell an unknown type apart from a malformed body.
#[derive(Deserialize)]
struct Tag {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl Envelope {
    /// Serialize to a frame.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let tag: Tag = serde_json::from_slice(frame)?;
        match tag.kind.as_deref() {
            Some("DATA") | Some("JOIN-REQUEST") => Ok(serde_json::from_slice(frame)?),
            Some(other) => Err(Error::Protocol(format!("invalid message type {other:?}"))),
            None => Err(Error::Protocol("frame without a message type".into())),
        }
    }
}
