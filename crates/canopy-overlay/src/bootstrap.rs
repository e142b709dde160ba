//! The transport/bootstrap collaborator seam.
//!
//! The overlay never touches the network itself. An embedder supplies a
//! [`Bootstrap`] that can open outbound attempts (to the root, or toward a
//! joining origin seeded with its first signal) and register a process as the
//! root of a tree. Each attempt is a [`Socket`]; its lifecycle is reported
//! through the [`EventHandler`] given to [`Bootstrap::connect`].

use bytes::Bytes;

use crate::error::Result;
use crate::types::{InboundRequest, JoinRequest, PeerOptions, Signal};

/// Lifecycle and data events of one underlying connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Handshake complete.
    Connect,
    /// One frame from the remote end.
    Data(Bytes),
    /// The connection closed.
    Close,
    /// The connection failed.
    Error(String),
}

/// Handler invoked by the collaborator for every event of one socket.
pub type EventHandler = Box<dyn Fn(SocketEvent) + Send + Sync>;

/// Handler invoked by the collaborator for every join request reaching a root.
pub type RequestHandler = Box<dyn Fn(InboundRequest) + Send + Sync>;

/// One outbound connection attempt.
pub trait Socket: Send + Sync {
    /// Feed additional handshake data into an in-progress attempt.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Write one frame.
    fn send(&self, frame: Bytes) -> Result<()>;

    /// Release the connection. Called at most once per socket by the overlay.
    fn destroy(&self);
}

/// Transport and bootstrap service used by a node.
pub trait Bootstrap: Send + Sync {
    /// Open an outbound attempt.
    ///
    /// `request` is `None` when contacting the root to join; otherwise its
    /// signal seeds the connection toward `request.origin`. Events must be
    /// reported through `events`, never by calling back into the node.
    fn connect(
        &self,
        request: Option<&JoinRequest>,
        options: &PeerOptions,
        events: EventHandler,
    ) -> Box<dyn Socket>;

    /// Register this process as the tree root under `secret`.
    fn root(&self, secret: &str, requests: RequestHandler) -> Result<()>;
}
