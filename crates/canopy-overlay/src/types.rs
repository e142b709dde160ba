//! Identifiers and join requests.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque handshake payload of the underlying transport, forwarded verbatim.
pub type Signal = serde_json::Value;

/// Transport-specific peer configuration, passed through to the collaborator.
pub type PeerOptions = serde_json::Value;

/// Wire value of the join-request message type.
pub const JOIN_REQUEST_TYPE: &str = "JOIN-REQUEST";

/// Identifier of a tree participant: 4 random bytes, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId([u8; 4]);

impl NodeId {
    /// Length of the hex encoding.
    pub const HEX_LEN: usize = 8;

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh identifier. Collisions are not handled.
    pub fn random() -> Self {
        Self(rand::thread_rng().gen::<u32>().to_be_bytes())
    }

    /// Raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Integer value of the first 6 hex characters (the first 3 bytes).
    pub fn prefix(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN {
            return Err(Error::InvalidNodeId(s.to_string()));
        }
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidNodeId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_hex()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// Node-local handle for one channel, unique for the node's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request from `origin` to be attached somewhere in the tree.
///
/// The same origin may issue several requests while its handshake progresses;
/// each carries the next `signal` continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub origin: NodeId,
    pub signal: Signal,
}

impl JoinRequest {
    pub fn new(origin: NodeId, signal: Signal) -> Self {
        Self { origin, signal }
    }
}

/// A join request as handed to a root by the bootstrap collaborator.
///
/// The collaborator may leave the type undeclared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub origin: NodeId,
    #[serde(default)]
    pub signal: Signal,
}

impl InboundRequest {
    /// An untyped request, as most collaborators deliver them.
    pub fn untyped(origin: NodeId, signal: Signal) -> Self {
        Self {
            kind: None,
            origin,
            signal,
        }
    }

    /// Tag an untyped request as a join request; reject any other declared type.
    pub fn into_join_request(self) -> Result<JoinRequest> {
        match self.kind.as_deref() {
            None | Some(JOIN_REQUEST_TYPE) => Ok(JoinRequest::new(self.origin, self.signal)),
            Some(other) => Err(Error::InvalidRequest(format!(
                "request from {} declares type {:?}",
                self.origin, other
            ))),
        }
    }
}
