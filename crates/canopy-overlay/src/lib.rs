//! Canopy Overlay - Degree-Bounded Spanning Trees over Point-to-Point Links
//!
//! This crate builds and maintains a spanning tree of peers in which every
//! node accepts at most `max_degree` children. A joining node only ever talks
//! to the root's bootstrap endpoint; the root and every node below it either
//! admit the newcomer directly or hand its join request down to a child, so
//! the tree grows without any node needing a global view.
//!
//! # Overview
//!
//! ## Join routing
//!
//! A join request carries the origin's identifier and one opaque handshake
//! signal. The node that receives it:
//!
//! - **Continues** an attempt already under way for that origin, feeding the
//!   signal into the existing connection
//! - **Admits** the origin as a candidate while `children + candidates` is
//!   below `max_degree`
//! - **Delegates** otherwise, to the child slot picked by [`delegate_index`],
//!   deferring the request if that slot is still empty
//!
//! Candidates that connect are promoted to children; attempts that do not
//! connect within [`NodeConfig::request_timeout`] are abandoned.
//!
//! ## Transport seam
//!
//! The overlay never opens sockets itself. An embedder supplies a
//! [`Bootstrap`] that opens [`Socket`]s and registers the root; see the
//! `canopy-transport` crate for an in-process implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use canopy_overlay::{Node, NodeConfig, NodeEvent};
//!
//! let root = Node::builder().bootstrap(network.clone()).build()?;
//! root.become_root("secret").await?;
//!
//! let node = Node::builder()
//!     .bootstrap(network.clone())
//!     .config(NodeConfig::default().with_max_degree(4))
//!     .build()?;
//! let mut events = node.subscribe();
//! node.join().await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let NodeEvent::ParentConnect(parent) = event {
//!         parent.send("hello")?;
//!     }
//! }
//! ```

pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod delegation;
pub mod error;
pub mod event;
pub mod membership;
pub mod node;
mod router;
mod supervisor;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use bootstrap::{Bootstrap, EventHandler, RequestHandler, Socket, SocketEvent};
pub use channel::{Channel, ChannelState};
pub use config::{NodeConfig, DEFAULT_MAX_DEGREE, DEFAULT_REQUEST_TIMEOUT};
pub use delegation::{delegate_index, DelegationMode};
pub use error::{Error, Result};
pub use event::{ChannelEvent, ChannelEvents, NodeEvent, NodeStatus};
pub use membership::Membership;
pub use node::{Node, NodeBuilder};
pub use types::{ChannelId, InboundRequest, JoinRequest, NodeId, PeerOptions, Signal};
pub use wire::Envelope;
