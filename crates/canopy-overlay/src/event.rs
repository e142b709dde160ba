//! Observations a node reports to the embedding application.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::channel::{Channel, ChannelState};
use crate::error::Error;
use crate::types::NodeId;

/// Everything a node reports, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The parent attempt completed its handshake.
    ParentConnect(Channel),

    /// The parent link closed.
    ParentClose(Channel),

    /// The parent link failed.
    ParentError(Channel, Arc<Error>),

    /// A candidate was promoted into a child slot.
    ChildConnect(Channel),

    /// A child or candidate link closed.
    ChildClose(Channel),

    /// A child or candidate link failed, including protocol violations.
    ChildError(Channel, Arc<Error>),

    /// An application payload arrived.
    Data {
        payload: serde_json::Value,
        channel: Channel,
        from_parent: bool,
    },

    /// The bootstrap collaborator handed the root an invalid request.
    RequestRejected(Arc<Error>),

    /// The node was torn down.
    Close,
}

impl NodeEvent {
    /// Channel the event concerns, if any.
    pub fn channel(&self) -> Option<&Channel> {
        match self {
            NodeEvent::ParentConnect(c)
            | NodeEvent::ParentClose(c)
            | NodeEvent::ParentError(c, _)
            | NodeEvent::ChildConnect(c)
            | NodeEvent::ChildClose(c)
            | NodeEvent::ChildError(c, _) => Some(c),
            NodeEvent::Data { channel, .. } => Some(channel),
            NodeEvent::RequestRejected(_) | NodeEvent::Close => None,
        }
    }

    /// This event as seen by `channel`, if it concerns that channel.
    pub fn for_channel(&self, channel: &Channel) -> Option<ChannelEvent> {
        match self {
            NodeEvent::ParentConnect(c) | NodeEvent::ChildConnect(c) if c == channel => {
                Some(ChannelEvent::Connect)
            }
            NodeEvent::ParentClose(c) | NodeEvent::ChildClose(c) if c == channel => {
                Some(ChannelEvent::Close)
            }
            NodeEvent::ParentError(c, err) | NodeEvent::ChildError(c, err) if c == channel => {
                Some(ChannelEvent::Error(Arc::clone(err)))
            }
            NodeEvent::Data { payload, channel: c, .. } if c == channel => {
                Some(ChannelEvent::Data(payload.clone()))
            }
            _ => None,
        }
    }
}

/// The events of a single channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Handshake complete.
    Connect,
    /// An application payload arrived on this channel.
    Data(serde_json::Value),
    /// The channel closed.
    Close,
    /// The channel failed.
    Error(Arc<Error>),
}

impl ChannelEvent {
    /// Whether no further events follow on this channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Close | ChannelEvent::Error(_))
    }
}

/// Subscription to the events of one channel, obtained from
/// [`Node::channel_events`](crate::Node::channel_events).
pub struct ChannelEvents {
    channel: Channel,
    events: broadcast::Receiver<NodeEvent>,
    done: bool,
}

impl ChannelEvents {
    pub(crate) fn new(channel: Channel, events: broadcast::Receiver<NodeEvent>) -> Self {
        Self {
            channel,
            events,
            done: false,
        }
    }

    /// The channel being watched.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next event of the channel.
    ///
    /// Returns `None` after the channel's close or error event, or once the
    /// node has closed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.events.recv().await {
                Ok(NodeEvent::Close) => {
                    self.done = true;
                    return None;
                }
                Ok(event) => {
                    if let Some(event) = event.for_channel(&self.channel) {
                        self.done = event.is_terminal();
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel.id(), skipped, "channel subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvents")
            .field("channel", &self.channel.id())
            .field("done", &self.done)
            .finish()
    }
}

/// Point-in-time view of a node's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub is_root: bool,
    /// State of the parent link, `None` when there is none.
    pub parent: Option<ChannelState>,
    /// Remote identifiers of the children, in slot order.
    pub children: Vec<NodeId>,
    pub children_count: usize,
    pub candidate_count: usize,
    pub deferred_requests: usize,
    pub max_degree: usize,
}

impl NodeStatus {
    /// Whether the parent link has completed its handshake.
    pub fn parent_connected(&self) -> bool {
        self.parent == Some(ChannelState::Connected)
    }
}
