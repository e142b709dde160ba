//! Channel - frames one transport connection into DATA and JOIN-REQUEST messages.
//!
//! A [`Channel`] is a cheap handle: clones share the same connection, and two
//! handles compare equal only if they wrap the same connection. The node keeps
//! one clone in its membership tables and hands others to the application in
//! [`NodeEvent`](crate::NodeEvent)s so it can [`send`](Channel::send) payloads.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, trace};

use crate::bootstrap::Socket;
use crate::error::{Error, Result};
use crate::types::{ChannelId, JoinRequest, NodeId, Signal};
use crate::wire::Envelope;

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Handshake in progress.
    Connecting,
    /// Handshake complete.
    Connected,
    /// Destroyed locally or closed by the remote end.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Data(serde_json::Value),
    JoinRequest(JoinRequest),
}

struct Inner {
    id: ChannelId,
    /// `None` marks the parent link.
    peer: Option<NodeId>,
    socket: Box<dyn Socket>,
    state: Mutex<ChannelState>,
}

/// One framed connection to the parent or to a (candidate) child.
///
/// A channel does not emit events itself. Its node reports everything that
/// happens on it as [`NodeEvent`](crate::NodeEvent)s, and
/// [`Node::channel_events`](crate::Node::channel_events) narrows those down
/// to the [`ChannelEvent`](crate::ChannelEvent)s of one channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, peer: Option<NodeId>, socket: Box<dyn Socket>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                peer,
                socket,
                state: Mutex::new(ChannelState::Connecting),
            }),
        }
    }

    /// Node-local handle of this channel.
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Identifier of the remote peer, `None` for the parent link.
    pub fn peer(&self) -> Option<NodeId> {
        self.inner.peer
    }

    /// Whether this channel leads to the node's parent.
    pub fn is_parent(&self) -> bool {
        self.inner.peer.is_none()
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_guard()
    }

    /// Send an application payload inside a DATA envelope.
    ///
    /// Delivery guarantees are those of the underlying transport.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        self.ensure_open()?;
        let frame = Envelope::Data {
            data: serde_json::to_value(payload)?,
        }
        .encode()?;
        trace!(channel = %self.id(), len = frame.len(), "sending data");
        self.inner.socket.send(frame)
    }

    /// Forward a join request verbatim.
    pub(crate) fn send_join_request(&self, req: &JoinRequest) -> Result<()> {
        self.ensure_open()?;
        debug!(channel = %self.id(), origin = %req.origin, "sending join request");
        let frame = Envelope::JoinRequest(req.clone()).encode()?;
        self.inner.socket.send(frame)
    }

    /// Feed a handshake continuation to the underlying attempt.
    pub(crate) fn signal(&self, signal: Signal) -> Result<()> {
        self.ensure_open()?;
        self.inner.socket.signal(signal)
    }

    /// Classify one inbound frame.
    pub(crate) fn decode(&self, frame: &[u8]) -> Result<Inbound> {
        trace!(channel = %self.id(), frame = %String::from_utf8_lossy(frame), "received frame");
        match Envelope::decode(frame)? {
            Envelope::Data { data } => Ok(Inbound::Data(data)),
            Envelope::JoinRequest(req) => Ok(Inbound::JoinRequest(req)),
        }
    }

    pub(crate) fn mark_connected(&self) {
        let mut state = self.state_guard();
        if *state == ChannelState::Connecting {
            *state = ChannelState::Connected;
        }
    }

    /// Release the underlying socket. Destroying twice is a no-op.
    pub fn destroy(&self) {
        {
            let mut state = self.state_guard();
            if *state == ChannelState::Closed {
                trace!(channel = %self.id(), "already closed");
                return;
            }
            *state = ChannelState::Closed;
        }
        debug!(channel = %self.id(), peer = ?self.peer(), "destroying channel");
        self.inner.socket.destroy();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == ChannelState::Closed {
            return Err(Error::ChannelClosed(self.id()));
        }
        Ok(())
    }

    fn state_guard(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSocket;
    use serde_json::json;

    fn channel(peer: Option<NodeId>) -> (Channel, Arc<MockSocket>) {
        let socket = Arc::new(MockSocket::default());
        (Channel::new(ChannelId(7), peer, Box::new(Arc::clone(&socket))), socket)
    }

    #[test]
    fn parent_sentinel() {
        let (parent, _) = channel(None);
        assert!(parent.is_parent());
        let (child, _) = channel(Some(NodeId::from_bytes([1, 2, 3, 4])));
        assert!(!child.is_parent());
    }

    #[test]
    fn send_wraps_payload_in_data_envelope() {
        let (ch, socket) = channel(None);
        ch.send("ping").unwrap();
        let frames = socket.sent();
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&frames[0]).unwrap();
        assert_eq!(value, json!({ "type": "DATA", "data": "ping" }));
    }

    #[test]
    fn join_request_is_forwarded_verbatim() {
        let (ch, socket) = channel(Some(NodeId::from_bytes([9, 9, 9, 9])));
        let req = JoinRequest::new(NodeId::from_bytes([1, 1, 1, 1]), json!({ "sdp": "x" }));
        ch.send_join_request(&req).unwrap();
        assert_eq!(
            Envelope::decode(&socket.sent()[0]).unwrap(),
            Envelope::JoinRequest(req)
        );
    }

    #[test]
    fn decode_classifies_frames() {
        let (ch, _) = channel(None);
        assert_eq!(
            ch.decode(br#"{"type":"DATA","data":[1,2]}"#).unwrap(),
            Inbound::Data(json!([1, 2]))
        );
        assert!(matches!(
            ch.decode(br#"{"type":"JOIN-REQUEST","origin":"01020304","signal":null}"#).unwrap(),
            Inbound::JoinRequest(_)
        ));
        assert!(ch.decode(br#"{"type":"HELLO"}"#).unwrap_err().is_protocol_violation());
    }

    #[test]
    fn destroy_is_idempotent() {
        let (ch, socket) = channel(None);
        ch.destroy();
        ch.destroy();
        assert_eq!(socket.destroy_count(), 1);
        assert_eq!(ch.state(), ChannelState::Closed);
        assert!(matches!(ch.send("late"), Err(Error::ChannelClosed(ChannelId(7)))));
    }

    #[test]
    fn state_transitions() {
        let (ch, socket) = channel(None);
        assert_eq!(ch.state(), ChannelState::Connecting);
        ch.mark_connected();
        assert_eq!(ch.state(), ChannelState::Connected);
        ch.destroy();
        assert_eq!(ch.state(), ChannelState::Closed);
        assert_eq!(socket.destroy_count(), 1);
        // Connecting again after a close is ignored.
        ch.mark_connected();
        assert_eq!(ch.state(), ChannelState::Closed);
    }

    #[test]
    fn identity_equality() {
        let (a, _) = channel(None);
        let (b, _) = channel(None);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
