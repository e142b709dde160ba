//! Error types for canopy-overlay.

use thiserror::Error;

use crate::types::ChannelId;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a node.
#[derive(Debug, Error)]
pub enum Error {
    /// The node was built without a transport/bootstrap collaborator.
    #[error("missing bootstrap collaborator")]
    MissingBootstrap,

    /// A configuration value is out of range or unparsable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A node identifier is not 8 hex characters.
    #[error("invalid node identifier: {0}")]
    InvalidNodeId(String),

    /// A root join request declared a type other than JOIN-REQUEST.
    #[error("invalid join request: {0}")]
    InvalidRequest(String),

    /// A frame carried an unknown message type.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame could not be parsed as an envelope.
    #[error("malformed frame: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying socket reported an error or refused a write.
    #[error("transport error: {0}")]
    Transport(String),

    /// A membership invariant would have been broken.
    #[error("membership invariant violated: {0}")]
    Invariant(String),

    /// The node is in the wrong state for the requested operation.
    #[error("invalid node state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// The channel has been destroyed.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    /// The node has been closed.
    #[error("node has been closed")]
    Closed,
}

impl Error {
    /// Whether this error is fatal to a single channel's framing.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Serialization(_))
    }

    /// Whether this error signals a routing bug rather than a peer fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::Invariant(_))
    }
}
