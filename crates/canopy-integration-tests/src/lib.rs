//! Harness for end-to-end canopy tests.
//!
//! Builds a root and any number of joining nodes on one [`MemoryNetwork`] and
//! offers small helpers to wait for tree events.

use std::sync::{Arc, Once};
use std::time::Duration;

use canopy_overlay::{Bootstrap, Node, NodeConfig, NodeEvent, Result};
use canopy_transport::{MemoryNetwork, MemoryNetworkConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const SECRET: &str = "secret";

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(10);

/// Install a test-writer subscriber once per process, honouring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "canopy_overlay=info,canopy_transport=info".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A node together with the receiver subscribed right after it was built.
pub struct Member {
    pub node: Node,
    pub events: broadcast::Receiver<NodeEvent>,
}

impl Member {
    /// Wait for the first event matching `pred`, skipping the rest.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<NodeEvent>
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return Some(event),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn wait_parent_connect(&mut self) -> Option<NodeEvent> {
        self.wait_for(|e| matches!(e, NodeEvent::ParentConnect(_))).await
    }

    pub async fn wait_child_connect(&mut self) -> Option<NodeEvent> {
        self.wait_for(|e| matches!(e, NodeEvent::ChildConnect(_))).await
    }
}

/// One in-memory tree.
pub struct Tree {
    pub network: Arc<MemoryNetwork>,
    pub config: NodeConfig,
}

impl Tree {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_network(config, MemoryNetworkConfig::default())
    }

    pub fn with_network(config: NodeConfig, network: MemoryNetworkConfig) -> Self {
        init_tracing();
        Self {
            network: Arc::new(MemoryNetwork::with_config(SECRET, network)),
            config,
        }
    }

    fn member(&self) -> Result<Member> {
        let node = Node::builder()
            .bootstrap(Arc::clone(&self.network) as Arc<dyn Bootstrap>)
            .config(self.config.clone())
            .build()?;
        let events = node.subscribe();
        Ok(Member { node, events })
    }

    /// Build a node and register it as the root.
    pub async fn root(&self) -> Result<Member> {
        let member = self.member()?;
        member.node.become_root(SECRET).await?;
        Ok(member)
    }

    /// Build a node and start its join.
    pub async fn join(&self) -> Result<Member> {
        let member = self.member()?;
        member.node.join().await?;
        Ok(member)
    }
}
