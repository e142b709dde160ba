//! Canopy Transport - In-Process Collaborator for Canopy Trees
//!
//! Provides [`MemoryNetwork`], an implementation of
//! [`canopy_overlay::Bootstrap`] that keeps every socket inside the current
//! process. It stands in for a signaling server plus a peer-to-peer transport
//! so whole trees can be built and torn down in tests and local tools.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use canopy_overlay::Node;
//! use canopy_transport::MemoryNetwork;
//!
//! let network = Arc::new(MemoryNetwork::new("secret"));
//! let root = Node::builder().bootstrap(network.clone()).build()?;
//! root.become_root("secret").await?;
//! ```

pub mod memory;

pub use memory::{MemoryNetwork, MemoryNetworkConfig};
