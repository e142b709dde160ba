//! Join-request router - the tree membership state machine.
//!
//! From one node's point of view an origin moves through:
//!
//! ```text
//! Unknown ──(capacity)──▶ Candidate ──(connect)──▶ Child
//!    │                        │
//!    │(full)                  └──(timeout/close/error)──▶ Abandoned ──▶ Unknown
//!    ▼
//! delegated to slot delegate(origin): forwarded to its occupant, or
//! deferred until the slot fills
//! ```
//!
//! On every join request the router re-reads the membership store, so a
//! request racing a candidate's timeout or promotion lands in whichever state
//! the store is in at that moment.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::bootstrap::{Bootstrap, EventHandler, SocketEvent};
use crate::channel::{Channel, Inbound};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::event::{NodeEvent, NodeStatus};
use crate::membership::Membership;
use crate::node::Input;
use crate::supervisor::TimeoutSupervisor;
use crate::types::{ChannelId, InboundRequest, JoinRequest, NodeId};

/// Where a channel sits in this node's view of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Parent,
    Candidate,
    Child(usize),
}

/// Routing state of one node. Driven by the node actor, one input at a time.
pub(crate) struct Router {
    id: NodeId,
    config: NodeConfig,
    bootstrap: Arc<dyn Bootstrap>,
    membership: Membership,
    parent: Option<Channel>,
    supervisor: TimeoutSupervisor,
    inbox: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<NodeEvent>,
    next_channel: u64,
    is_root: bool,
}

impl Router {
    pub(crate) fn new(
        id: NodeId,
        config: NodeConfig,
        bootstrap: Arc<dyn Bootstrap>,
        inbox: mpsc::UnboundedSender<Input>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            id,
            membership: Membership::new(config.max_degree),
            supervisor: TimeoutSupervisor::new(config.request_timeout, inbox.clone()),
            config,
            bootstrap,
            parent: None,
            inbox,
            events,
            next_channel: 0,
            is_root: false,
        }
    }

    pub(crate) fn membership(&self) -> &Membership {
        &self.membership
    }

    #[cfg(test)]
    pub(crate) fn parent(&self) -> Option<&Channel> {
        self.parent.as_ref()
    }

    /// Open the parent attempt toward the root.
    pub(crate) fn join(&mut self) -> Result<()> {
        if let Some(parent) = &self.parent {
            return Err(Error::InvalidState {
                expected: "no parent link",
                actual: format!("parent channel {} is {}", parent.id(), parent.state()),
            });
        }
        if self.is_root {
            return Err(Error::InvalidState {
                expected: "non-root node",
                actual: "node is the root".into(),
            });
        }

        let channel_id = self.next_channel_id();
        debug!(node = %self.id, options = %self.config.peer_options, "creating a peer connection to the root");
        let socket = self
            .bootstrap
            .connect(None, &self.config.peer_options, self.socket_handler(channel_id));
        self.parent = Some(Channel::new(channel_id, None, socket));
        self.supervisor.arm(channel_id);
        info!(node = %self.id, channel = %channel_id, "joining tree");
        Ok(())
    }

    /// Register with the collaborator as the tree's entry point.
    pub(crate) fn become_root(&mut self, secret: &str) -> Result<()> {
        if self.is_root {
            return Err(Error::InvalidState {
                expected: "non-root node",
                actual: "node is already the root".into(),
            });
        }
        if self.parent.is_some() {
            return Err(Error::InvalidState {
                expected: "no parent link",
                actual: "node is joining or attached to a tree".into(),
            });
        }

        let inbox = self.inbox.clone();
        self.bootstrap.root(
            secret,
            Box::new(move |req| {
                let _ = inbox.send(Input::RootRequest(req));
            }),
        )?;
        self.is_root = true;
        info!(node = %self.id, "registered as root");
        Ok(())
    }

    /// A join request delivered by the collaborator to this root.
    pub(crate) fn accept_root_request(&mut self, inbound: InboundRequest) -> Result<()> {
        match inbound.into_join_request() {
            Ok(req) => self.handle_join_request(req),
            Err(err) => {
                warn!(node = %self.id, error = %err, "rejecting root request");
                self.emit(NodeEvent::RequestRejected(Arc::new(err)));
                Ok(())
            }
        }
    }

    /// Route one join request: continue, admit, or delegate.
    pub(crate) fn handle_join_request(&mut self, req: JoinRequest) -> Result<()> {
        debug!(
            node = %self.id,
            origin = %req.origin,
            children = self.membership.children_count(),
            candidates = self.membership.candidate_count(),
            max_degree = self.membership.max_degree(),
            "handling join request"
        );

        // Further signaling for an attempt that already exists.
        let existing = self.membership.candidate(&req.origin).cloned().or_else(|| {
            self.membership
                .child_slot_of(&req.origin)
                .and_then(|slot| self.membership.child(slot).cloned())
        });
        if let Some(channel) = existing {
            debug!(node = %self.id, origin = %req.origin, channel = %channel.id(), "forwarding signal to existing attempt");
            return channel.signal(req.signal);
        }

        if self.membership.has_capacity() {
            self.create_candidate(req)
        } else {
            self.delegate(req)
        }
    }

    fn create_candidate(&mut self, req: JoinRequest) -> Result<()> {
        let channel_id = self.next_channel_id();
        let socket = self.bootstrap.connect(
            Some(&req),
            &self.config.peer_options,
            self.socket_handler(channel_id),
        );
        let channel = Channel::new(channel_id, Some(req.origin), socket);
        if let Err(err) = self.membership.add_candidate(channel.clone()) {
            channel.destroy();
            return Err(err);
        }
        self.supervisor.arm(channel_id);
        debug!(node = %self.id, origin = %req.origin, channel = %channel_id, "created candidate");
        Ok(())
    }

    fn delegate(&mut self, req: JoinRequest) -> Result<()> {
        let slot = self
            .config
            .delegation
            .index(&req.origin, &self.id, self.membership.max_degree());
        match self.membership.child(slot).cloned() {
            Some(child) => {
                debug!(node = %self.id, origin = %req.origin, slot, child = ?child.peer(), "delegating request to child");
                child.send_join_request(&req)
            }
            None => {
                debug!(node = %self.id, origin = %req.origin, slot, "deferring request until slot fills");
                self.membership.defer(slot, req)
            }
        }
    }

    /// React to one event of one of this node's sockets.
    pub(crate) fn on_socket_event(&mut self, channel_id: ChannelId, event: SocketEvent) -> Result<()> {
        let Some((role, channel)) = self.lookup(channel_id) else {
            trace!(node = %self.id, channel = %channel_id, ?event, "dropping event for unknown channel");
            return Ok(());
        };

        match event {
            SocketEvent::Connect => self.on_connect(role, channel),
            SocketEvent::Data(frame) => match channel.decode(&frame) {
                Ok(Inbound::Data(payload)) => {
                    self.emit(NodeEvent::Data {
                        payload,
                        channel,
                        from_parent: role == Role::Parent,
                    });
                    Ok(())
                }
                Ok(Inbound::JoinRequest(req)) => self.handle_join_request(req),
                Err(err) => {
                    warn!(node = %self.id, channel = %channel_id, error = %err, "protocol violation, closing channel");
                    channel.destroy();
                    self.on_failure(role, channel, err);
                    Ok(())
                }
            },
            SocketEvent::Close => {
                // The remote end is gone; release our side of the socket.
                channel.destroy();
                self.on_close(role, channel);
                Ok(())
            }
            SocketEvent::Error(reason) => {
                channel.destroy();
                self.on_failure(role, channel, Error::Transport(reason));
                Ok(())
            }
        }
    }

    fn on_connect(&mut self, role: Role, channel: Channel) -> Result<()> {
        match role {
            Role::Parent => {
                self.supervisor.cancel(channel.id());
                channel.mark_connected();
                info!(node = %self.id, channel = %channel.id(), "connected to parent");
                self.emit(NodeEvent::ParentConnect(channel));
                Ok(())
            }
            Role::Candidate => {
                self.supervisor.cancel(channel.id());
                let slot = match self.membership.add_child(channel.clone()) {
                    Ok(slot) => slot,
                    Err(err) => {
                        if let Some(peer) = channel.peer() {
                            self.membership.remove_candidate(&peer);
                        }
                        channel.destroy();
                        return Err(err);
                    }
                };
                channel.mark_connected();
                info!(node = %self.id, child = ?channel.peer(), slot, "child connected");

                for req in self.membership.take_deferred(slot) {
                    debug!(node = %self.id, origin = %req.origin, slot, "replaying deferred request");
                    if let Err(err) = channel.send_join_request(&req) {
                        warn!(node = %self.id, origin = %req.origin, error = %err, "failed to replay deferred request");
                    }
                }
                self.emit(NodeEvent::ChildConnect(channel));
                Ok(())
            }
            Role::Child(slot) => {
                trace!(node = %self.id, slot, "duplicate connect from child ignored");
                Ok(())
            }
        }
    }

    fn on_close(&mut self, role: Role, channel: Channel) {
        self.supervisor.cancel(channel.id());
        self.detach(role, &channel);
        match role {
            Role::Parent => {
                info!(node = %self.id, "parent closed");
                self.emit(NodeEvent::ParentClose(channel));
            }
            Role::Candidate | Role::Child(_) => {
                info!(node = %self.id, child = ?channel.peer(), "child closed");
                self.emit(NodeEvent::ChildClose(channel));
            }
        }
    }

    fn on_failure(&mut self, role: Role, channel: Channel, err: Error) {
        self.supervisor.cancel(channel.id());
        self.detach(role, &channel);
        let err = Arc::new(err);
        match role {
            Role::Parent => {
                warn!(node = %self.id, error = %err, "parent error");
                self.emit(NodeEvent::ParentError(channel, err));
            }
            Role::Candidate | Role::Child(_) => {
                warn!(node = %self.id, child = ?channel.peer(), error = %err, "child error");
                self.emit(NodeEvent::ChildError(channel, err));
            }
        }
    }

    fn detach(&mut self, role: Role, channel: &Channel) {
        match role {
            Role::Parent => self.parent = None,
            Role::Candidate => {
                if let Some(peer) = channel.peer() {
                    self.membership.remove_candidate(&peer);
                }
            }
            Role::Child(_) => {
                self.membership.remove_child(channel);
            }
        }
    }

    /// An attempt's timer elapsed.
    pub(crate) fn on_timeout(&mut self, channel_id: ChannelId) {
        if !self.supervisor.expire(channel_id) {
            trace!(node = %self.id, channel = %channel_id, "stale timeout ignored");
            return;
        }
        match self.lookup(channel_id) {
            Some((Role::Parent, parent)) => {
                debug!(node = %self.id, "connection to parent failed");
                parent.destroy();
                self.parent = None;
            }
            Some((Role::Candidate, candidate)) => {
                debug!(node = %self.id, origin = ?candidate.peer(), "connection to candidate failed");
                candidate.destroy();
                self.detach(Role::Candidate, &candidate);
            }
            Some((Role::Child(_), _)) | None => {}
        }
    }

    /// Destroy every channel and forget all membership.
    pub(crate) fn close(&mut self) {
        if let Some(parent) = self.parent.take() {
            parent.destroy();
        }
        for channel in self.membership.clear() {
            channel.destroy();
        }
        self.supervisor.clear();
        info!(node = %self.id, "node closed");
        self.emit(NodeEvent::Close);
    }

    pub(crate) fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            is_root: self.is_root,
            parent: self.parent.as_ref().map(Channel::state),
            children: self
                .membership
                .children()
                .filter_map(|(_, c)| c.peer())
                .collect(),
            children_count: self.membership.children_count(),
            candidate_count: self.membership.candidate_count(),
            deferred_requests: self.membership.deferred_len(),
            max_degree: self.membership.max_degree(),
        }
    }

    fn lookup(&self, channel_id: ChannelId) -> Option<(Role, Channel)> {
        if let Some(parent) = self.parent.as_ref().filter(|p| p.id() == channel_id) {
            return Some((Role::Parent, parent.clone()));
        }
        if let Some((slot, child)) = self.membership.children().find(|(_, c)| c.id() == channel_id) {
            return Some((Role::Child(slot), child.clone()));
        }
        self.membership
            .candidates()
            .find(|c| c.id() == channel_id)
            .map(|c| (Role::Candidate, c.clone()))
    }

    fn socket_handler(&self, channel_id: ChannelId) -> EventHandler {
        let inbox = self.inbox.clone();
        Box::new(move |event| {
            let _ = inbox.send(Input::Socket {
                channel: channel_id,
                event,
            });
        })
    }

    fn next_channel_id(&mut self) -> ChannelId {
        self.next_channel += 1;
        ChannelId(self.next_channel)
    }

    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
