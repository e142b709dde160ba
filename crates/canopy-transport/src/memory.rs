//! In-process transport and bootstrap service.
//!
//! A [`MemoryNetwork`] plays both roles a tree needs from its environment:
//! the bootstrap server (authenticating the root by secret and relaying the
//! first join requests of newcomers to it) and the point-to-point transport
//! (pairing the socket a joining node opens with the socket some tree member
//! opens in response).
//!
//! Pairing is driven by opaque handshake signals, like a real offer/answer
//! exchange. Each joining node emits `signals_per_handshake` join requests;
//! the responder socket connects only once it has been fed all of them, so
//! continuations must reach the same responder for the handshake to finish.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use canopy_overlay::{
    Bootstrap, Error, EventHandler, InboundRequest, JoinRequest, NodeId, PeerOptions,
    RequestHandler, Result, Signal, Socket, SocketEvent,
};

type SharedEvents = Arc<dyn Fn(SocketEvent) + Send + Sync>;
type SharedRequests = Arc<dyn Fn(InboundRequest) + Send + Sync>;

/// Memory network configuration
#[derive(Debug, Clone)]
pub struct MemoryNetworkConfig {
    /// Join requests each joining node emits before its handshake completes.
    pub signals_per_handshake: usize,
}

impl Default for MemoryNetworkConfig {
    fn default() -> Self {
        Self {
            signals_per_handshake: 1,
        }
    }
}

impl MemoryNetworkConfig {
    #[must_use]
    pub fn with_signals_per_handshake(mut self, signals: usize) -> Self {
        self.signals_per_handshake = signals.max(1);
        self
    }
}

/// Payload of every signal this network generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Handshake {
    seq: usize,
    total: usize,
}

type EndpointId = u64;

enum Link {
    /// Joining side, waiting for some tree member to answer.
    Initiating,
    /// Answering side, collecting the initiator's signals.
    Responding {
        origin: NodeId,
        received: BTreeSet<usize>,
        total: usize,
    },
    Linked(EndpointId),
    /// The remote end went away.
    Closed,
}

struct Endpoint {
    events: SharedEvents,
    link: Link,
}

#[derive(Default)]
struct Registry {
    root: Option<SharedRequests>,
    endpoints: HashMap<EndpointId, Endpoint>,
    /// Initiator endpoint of every origin the network has assigned.
    origins: HashMap<NodeId, EndpointId>,
    next: EndpointId,
}

impl Registry {
    fn insert(&mut self, events: SharedEvents, link: Link) -> EndpointId {
        self.next += 1;
        self.endpoints.insert(self.next, Endpoint { events, link });
        self.next
    }

    fn events(&self, id: EndpointId) -> Option<SharedEvents> {
        self.endpoints.get(&id).map(|e| Arc::clone(&e.events))
    }
}

/// In-process bootstrap server and transport shared by every node of a test
/// tree.
#[derive(Clone)]
pub struct MemoryNetwork {
    secret: Arc<str>,
    config: MemoryNetworkConfig,
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    /// Network whose root must authenticate with `secret`.
    pub fn new(secret: impl Into<String>) -> Self {
        Self::with_config(secret, MemoryNetworkConfig::default())
    }

    pub fn with_config(secret: impl Into<String>, config: MemoryNetworkConfig) -> Self {
        Self {
            secret: Arc::from(secret.into()),
            config,
            registry: Arc::default(),
        }
    }

    pub fn config(&self) -> &MemoryNetworkConfig {
        &self.config
    }

    /// Sockets currently registered, in any state.
    pub fn open_sockets(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Whether a root is registered.
    pub fn has_root(&self) -> bool {
        self.lock().root.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self, id: EndpointId) -> Box<dyn Socket> {
        Box::new(MemorySocket {
            id,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Joining side: assign an origin and relay its join requests to the root.
    fn initiate(&self, events: SharedEvents) -> Box<dyn Socket> {
        let origin = NodeId::random();
        let (id, root) = {
            let mut registry = self.lock();
            let id = registry.insert(Arc::clone(&events), Link::Initiating);
            registry.origins.insert(origin, id);
            (id, registry.root.clone())
        };

        let Some(root) = root else {
            warn!(%origin, "no root registered");
            events(SocketEvent::Error("no root registered".into()));
            return self.socket(id);
        };

        let total = self.config.signals_per_handshake;
        debug!(%origin, total, "relaying join requests to root");
        for seq in 0..total {
            match serde_json::to_value(Handshake { seq, total }) {
                Ok(signal) => root(InboundRequest::untyped(origin, signal)),
                Err(err) => events(SocketEvent::Error(err.to_string())),
            }
        }
        self.socket(id)
    }

    /// Answering side: seed a responder with the request's first signal.
    fn respond(&self, request: &JoinRequest, events: SharedEvents) -> Box<dyn Socket> {
        let id = {
            let mut registry = self.lock();
            registry.insert(
                events,
                Link::Responding {
                    origin: request.origin,
                    received: BTreeSet::new(),
                    total: usize::MAX,
                },
            )
        };
        let socket = self.socket(id);
        if let Err(err) = socket.signal(request.signal.clone()) {
            let events = self.lock().events(id);
            if let Some(events) = events {
                events(SocketEvent::Error(err.to_string()));
            }
        }
        socket
    }
}

impl Bootstrap for MemoryNetwork {
    fn connect(
        &self,
        request: Option<&JoinRequest>,
        _options: &PeerOptions,
        events: EventHandler,
    ) -> Box<dyn Socket> {
        let events: SharedEvents = Arc::from(events);
        match request {
            None => self.initiate(events),
            Some(request) => self.respond(request, events),
        }
    }

    fn root(&self, secret: &str, requests: RequestHandler) -> Result<()> {
        if secret != &*self.secret {
            return Err(Error::Transport("invalid root secret".into()));
        }
        let mut registry = self.lock();
        if registry.root.is_some() {
            return Err(Error::Transport("a root is already registered".into()));
        }
        registry.root = Some(Arc::from(requests));
        debug!("root registered");
        Ok(())
    }
}

/// One end of an in-memory connection.
struct MemorySocket {
    id: EndpointId,
    registry: Arc<Mutex<Registry>>,
}

impl MemorySocket {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Socket for MemorySocket {
    fn signal(&self, signal: Signal) -> Result<()> {
        let handshake: Handshake = serde_json::from_value(signal)
            .map_err(|err| Error::Transport(format!("malformed signal: {err}")))?;

        // Events are collected under the lock and delivered after it is released.
        let mut deliveries: Vec<(SharedEvents, SocketEvent)> = Vec::new();
        {
            let mut registry = self.lock();
            let Some(endpoint) = registry.endpoints.get_mut(&self.id) else {
                return Err(Error::Transport("socket destroyed".into()));
            };
            let Link::Responding {
                origin,
                received,
                total,
            } = &mut endpoint.link
            else {
                trace!(endpoint = self.id, "signal after handshake ignored");
                return Ok(());
            };
            *total = handshake.total;
            received.insert(handshake.seq);
            trace!(endpoint = self.id, %origin, seq = handshake.seq, total = *total, "signal received");
            if (0..*total).any(|seq| !received.contains(&seq)) {
                return Ok(());
            }
            let origin = *origin;
            let own = Arc::clone(&endpoint.events);

            let initiator = registry.origins.get(&origin).copied();
            let peer = initiator.and_then(|i| registry.endpoints.get_mut(&i).map(|e| (i, e)));
            match peer {
                Some((initiator, peer)) if matches!(peer.link, Link::Initiating) => {
                    peer.link = Link::Linked(self.id);
                    let theirs = Arc::clone(&peer.events);
                    if let Some(endpoint) = registry.endpoints.get_mut(&self.id) {
                        endpoint.link = Link::Linked(initiator);
                    }
                    debug!(%origin, responder = self.id, initiator, "handshake complete");
                    deliveries.push((own, SocketEvent::Connect));
                    deliveries.push((theirs, SocketEvent::Connect));
                }
                Some(_) => {
                    // Another responder won; this attempt never connects.
                    debug!(%origin, responder = self.id, "initiator already linked");
                }
                None => {
                    let reason = format!("no pending peer {origin}");
                    deliveries.push((own, SocketEvent::Error(reason)));
                }
            }
        }
        for (events, event) in deliveries {
            events(event);
        }
        Ok(())
    }

    fn send(&self, frame: Bytes) -> Result<()> {
        let peer = {
            let registry = self.lock();
            match registry.endpoints.get(&self.id).map(|e| &e.link) {
                Some(Link::Linked(peer)) => registry.events(*peer),
                _ => None,
            }
        };
        let peer = peer.ok_or_else(|| Error::Transport("socket not connected".into()))?;
        trace!(endpoint = self.id, len = frame.len(), "delivering frame");
        peer(SocketEvent::Data(frame));
        Ok(())
    }

    fn destroy(&self) {
        let peer = {
            let mut registry = self.lock();
            let Some(endpoint) = registry.endpoints.remove(&self.id) else {
                return;
            };
            registry.origins.retain(|_, id| *id != self.id);
            match endpoint.link {
                Link::Linked(peer) => registry.endpoints.get_mut(&peer).map(|p| {
                    // The peer stays registered until its owner destroys it.
                    p.link = Link::Closed;
                    Arc::clone(&p.events)
                }),
                Link::Initiating | Link::Responding { .. } | Link::Closed => None,
            }
        };
        trace!(endpoint = self.id, "socket destroyed");
        if let Some(peer) = peer {
            peer(SocketEvent::Close);
        }
    }
}
