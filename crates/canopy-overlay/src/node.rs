//! The node actor and its public handle.
//!
//! Every input a node reacts to (socket events, timer expiries, root join
//! requests, API calls) is posted to one unbounded inbox and handled by a
//! single task, so membership is never touched concurrently.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bootstrap::{Bootstrap, SocketEvent};
use crate::channel::Channel;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::event::{ChannelEvents, NodeEvent, NodeStatus};
use crate::router::Router;
use crate::types::{ChannelId, InboundRequest, NodeId};

/// Capacity of the event broadcast. Slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 1024;

/// One unit of work for the node actor.
#[derive(Debug)]
pub(crate) enum Input {
    Socket {
        channel: ChannelId,
        event: SocketEvent,
    },
    Timeout(ChannelId),
    RootRequest(InboundRequest),
    Command(Command),
}

#[derive(Debug)]
pub(crate) enum Command {
    Join(oneshot::Sender<Result<()>>),
    BecomeRoot {
        secret: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Status(oneshot::Sender<NodeStatus>),
    Close(Option<oneshot::Sender<()>>),
}

/// Handle to a running tree node.
///
/// Dropping the handle closes the node.
pub struct Node {
    id: NodeId,
    inbox: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// This node's identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Receive the events of `channel` only, from now on.
    pub fn channel_events(&self, channel: &Channel) -> ChannelEvents {
        ChannelEvents::new(channel.clone(), self.events.subscribe())
    }

    /// Start joining the tree through the root.
    ///
    /// Returns once the attempt is opened; completion is reported as
    /// [`NodeEvent::ParentConnect`].
    pub async fn join(&self) -> Result<()> {
        self.request(Command::Join).await?
    }

    /// Register this node as the root under `secret`.
    pub async fn become_root(&self, secret: impl Into<String>) -> Result<()> {
        let secret = secret.into();
        self.request(|reply| Command::BecomeRoot { secret, reply })
            .await?
    }

    /// Snapshot of the node's membership.
    pub async fn status(&self) -> Result<NodeStatus> {
        self.request(Command::Status).await
    }

    /// Destroy every channel and stop the node.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Command::Close(Some(reply))).await
    }

    /// Whether the node task has stopped.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(command(tx)))
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.inbox.send(Input::Command(Command::Close(None)));
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id).finish()
    }
}

/// Builder for [`Node`].
#[derive(Default)]
pub struct NodeBuilder {
    bootstrap: Option<Arc<dyn Bootstrap>>,
    config: NodeConfig,
    id: Option<NodeId>,
}

impl NodeBuilder {
    /// Transport/bootstrap collaborator. Required.
    #[must_use]
    pub fn bootstrap(mut self, bootstrap: Arc<dyn Bootstrap>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    #[must_use]
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixed identifier instead of a random one.
    #[must_use]
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Validate the configuration and spawn the node task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Node> {
        let bootstrap = self.bootstrap.ok_or(Error::MissingBootstrap)?;
        self.config.validate()?;
        let id = self.id.unwrap_or_else(NodeId::random);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            node = %id,
            max_degree = self.config.max_degree,
            timeout = ?self.config.request_timeout,
            delegation = %self.config.delegation,
            "starting node"
        );
        let router = Router::new(id, self.config, bootstrap, inbox_tx.clone(), events.clone());
        tokio::spawn(run(router, inbox_rx));

        Ok(Node {
            id,
            inbox: inbox_tx,
            events,
        })
    }
}

async fn run(mut router: Router, mut inbox: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = inbox.recv().await {
        let outcome = match input {
            Input::Socket { channel, event } => router.on_socket_event(channel, event),
            Input::Timeout(channel) => {
                router.on_timeout(channel);
                Ok(())
            }
            Input::RootRequest(req) => router.accept_root_request(req),
            Input::Command(Command::Join(reply)) => {
                let _ = reply.send(router.join());
                Ok(())
            }
            Input::Command(Command::BecomeRoot { secret, reply }) => {
                let _ = reply.send(router.become_root(&secret));
                Ok(())
            }
            Input::Command(Command::Status(reply)) => {
                let _ = reply.send(router.status());
                Ok(())
            }
            Input::Command(Command::Close(reply)) => {
                router.close();
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                break;
            }
        };

        if let Err(err) = outcome {
            if err.is_invariant_violation() {
                error!(error = %err, "membership invariant violated");
            } else {
                warn!(error = %err, "failed to handle input");
            }
        }
        debug_assert!(
            router.membership().check_invariants().is_ok(),
            "membership invariants broken"
        );
    }
    debug!("node task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelEvent;
    use crate::testing::MockBootstrap;
    use serde_json::json;
    use std::time::Duration;

    fn node(bootstrap: &Arc<MockBootstrap>, config: NodeConfig) -> Node {
        Node::builder()
            .bootstrap(Arc::clone(bootstrap) as Arc<dyn Bootstrap>)
            .config(config)
            .id(NodeId::from_bytes([1, 2, 3, 4]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn build_requires_bootstrap() {
        let err = Node::builder().build().unwrap_err();
        assert!(matches!(err, Error::MissingBootstrap));
    }

    #[tokio::test]
    async fn build_rejects_zero_degree() {
        let err = Node::builder()
            .bootstrap(Arc::new(MockBootstrap::default()))
            .config(NodeConfig::default().with_max_degree(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn join_connects_to_root_and_reports_parent() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(&bootstrap, NodeConfig::default());
        let mut events = node.subscribe();

        node.join().await.unwrap();
        assert_eq!(bootstrap.connections(), 1);
        assert!(bootstrap.request(0).is_none());
        assert!(matches!(node.join().await, Err(Error::InvalidState { .. })));

        bootstrap.emit(0, SocketEvent::Connect);
        assert!(matches!(events.recv().await.unwrap(), NodeEvent::ParentConnect(_)));

        let status = node.status().await.unwrap();
        assert!(status.parent_connected());
        assert!(!status.is_root);
        assert_eq!(status.id, node.id());
    }

    #[tokio::test]
    async fn root_accepts_requests_and_sends_data() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(&bootstrap, NodeConfig::default().with_max_degree(2));
        let mut events = node.subscribe();

        node.become_root("secret").await.unwrap();
        let origin: NodeId = "abcdef01".parse().unwrap();
        bootstrap.deliver_root_request(InboundRequest::untyped(origin, json!({ "sdp": "offer" })));

        // The request is handled on the node task; status round-trips behind it.
        assert_eq!(node.status().await.unwrap().candidate_count, 1);
        bootstrap.emit(0, SocketEvent::Connect);

        let child = match events.recv().await.unwrap() {
            NodeEvent::ChildConnect(channel) => channel,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(child.peer(), Some(origin));
        child.send("ping").unwrap();
        assert_eq!(
            bootstrap.socket(0).sent(),
            vec![bytes::Bytes::from_static(br#"{"type":"DATA","data":"ping"}"#)]
        );

        let status = node.status().await.unwrap();
        assert!(status.is_root);
        assert_eq!(status.children, vec![origin]);
    }

    #[tokio::test]
    async fn channel_events_follow_one_child() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(&bootstrap, NodeConfig::default().with_max_degree(2));
        let mut events = node.subscribe();

        node.become_root("secret").await.unwrap();
        for origin in ["abcdef01", "abcdef02"] {
            bootstrap.deliver_root_request(InboundRequest::untyped(
                origin.parse().unwrap(),
                json!({ "sdp": "offer" }),
            ));
        }
        assert_eq!(node.status().await.unwrap().candidate_count, 2);
        bootstrap.emit(0, SocketEvent::Connect);
        let child = match events.recv().await.unwrap() {
            NodeEvent::ChildConnect(channel) => channel,
            other => panic!("unexpected event {other:?}"),
        };

        let mut watched = node.channel_events(&child);
        assert_eq!(watched.channel(), &child);
        bootstrap.emit(1, SocketEvent::Connect);
        bootstrap.emit(
            0,
            SocketEvent::Data(bytes::Bytes::from_static(br#"{"type":"DATA","data":"pong"}"#)),
        );
        bootstrap.emit(0, SocketEvent::Close);

        assert!(matches!(watched.recv().await, Some(ChannelEvent::Data(p)) if p == json!("pong")));
        assert!(matches!(watched.recv().await, Some(ChannelEvent::Close)));
        assert!(watched.recv().await.is_none());
        assert_eq!(bootstrap.socket(0).destroy_count(), 1);
    }

    #[tokio::test]
    async fn close_stops_the_task() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(&bootstrap, NodeConfig::default());
        let mut events = node.subscribe();
        node.join().await.unwrap();

        node.close().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), NodeEvent::Close));
        assert_eq!(bootstrap.socket(0).destroy_count(), 1);
        assert!(matches!(node.status().await, Err(Error::Closed)));
        assert!(node.is_closed());
    }

    #[tokio::test]
    async fn dropping_the_handle_closes_the_node() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(&bootstrap, NodeConfig::default());
        node.join().await.unwrap();
        let socket = bootstrap.socket(0);

        drop(node);
        for _ in 0..100 {
            if socket.destroy_count() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("parent socket was not destroyed");
    }

    #[tokio::test(start_paused = true)]
    async fn parent_attempt_times_out_silently() {
        let bootstrap = Arc::new(MockBootstrap::default());
        let node = node(
            &bootstrap,
            NodeConfig::default().with_request_timeout(Duration::from_secs(5)),
        );
        let mut events = node.subscribe();
        node.join().await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let status = node.status().await.unwrap();
        assert_eq!(status.parent, None);
        assert_eq!(bootstrap.socket(0).destroy_count(), 1);
        assert!(events.try_recv().is_err());

        // A fresh attempt is allowed.
        node.join().await.unwrap();
        assert_eq!(bootstrap.connections(), 2);
    }
}
