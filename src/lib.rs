//! # gossipcast
//!
//! Membership and metadata gossip for small-to-medium clusters, with an
//! optional kernel fan-out fast path.
//!
//! Every node keeps two things in sync with the rest of the cluster:
//! - **Membership** - who is alive, refreshed by periodic heartbeats and
//!   forgotten after a TTL
//! - **Metadata** - one opaque, versioned blob; the newest version wins
//!
//! ## Quick Start
//!
//! ```ignore
//! use gossipcast::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GossipConfig::new().secret_key("cluster-secret");
//!     let transport = UdpTransport::bind("0.0.0.0:8000".parse()?, config.size).await?;
//!     let node = GossipNode::new(Node::new("10.0.0.1", 8000), config, Arc::new(transport))?;
//!
//!     // Seed one peer and join.
//!     node.set(Node::new("10.0.0.2", 8000));
//!     node.join().await?;
//!
//!     // Spread new metadata to everyone.
//!     node.publish(b"cfg-v2".to_vec()).await?;
//!     println!("Members: {:?}", node.nodes());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Stores** (`membership`, `metadata`) - concurrent state shared by all tasks
//! 2. **Protocol** (`network`) - the packet model and its JSON wire format
//! 3. **Engines** (`diffusion`, `fastpath`, `anti_entropy`) - how packets spread
//! 4. **Node** (`cluster`) - heartbeat, listener and consumer tasks
//!
//! Heartbeat waves spread epidemically: each hop forwards to at most `amount`
//! peers not yet listed in the wave's infected set. Anti-entropy swaps repair
//! whatever the waves miss. In `Tc`/`Xdp` modes, broadcasts are handed to a
//! kernel program in batches of up to 25 targets and sent once per batch.
//!
//! ## Thread Safety
//!
//! Stores are `Arc`-shared and need no external locking. No lock is ever held
//! across an `.await`.

pub mod allocator;
pub mod anti_entropy;
pub mod cluster;
pub mod config;
pub mod diffusion;
pub mod error;
pub mod fastpath;
pub mod membership;
pub mod metadata;
pub mod network;
pub mod transport;
pub mod types;

pub use anti_entropy::{AntiEntropy, SwapOutcome};
pub use cluster::{GossipNode, GossipStatus};
pub use config::{GossipConfig, TransportMode};
pub use diffusion::{BroadcastReport, Diffusion};
pub use error::{GossipError, GossipResult};
pub use fastpath::{FastPathBatcher, FastPathReport, TargetOffload};
pub use network::{Heartbeat, Message, Packet, Swap};
pub use transport::{MemoryNetwork, MemoryOffload, MemoryTransport, TcpTransport, Transport, UdpTransport};
pub use types::{BroadcastTarget, Infected, Metadata, Node};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use gossipcast::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cluster::{GossipNode, GossipStatus};
    pub use crate::config::{GossipConfig, TransportMode};
    pub use crate::error::{GossipError, GossipResult};
    pub use crate::fastpath::TargetOffload;
    pub use crate::transport::{TcpTransport, Transport, UdpTransport};
    pub use crate::types::{Metadata, Node};
}
