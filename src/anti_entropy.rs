/// Anti-entropy: pairwise metadata repair.
///
/// Heartbeat waves can miss nodes (loss, churn, a node that joined late). Once
/// per cycle every node sends its metadata version to one peer. The side with
/// the older version ends up adopting the newer one:
///
/// - the receiver is behind: it adopts the request's metadata, no reply;
/// - the sender is behind: the receiver answers with a swap response carrying
///   its own metadata, which the sender adopts;
/// - equal versions: nothing happens.
///
/// A response is never answered, so the exchange is at most two packets.
use crate::error::GossipResult;
use crate::fastpath::TargetOffload;
use crate::membership::MembershipStore;
use crate::metadata::MetadataStore;
use crate::network::{Message, Packet, Swap};
use crate::transport::Transport;
use crate::types::{Metadata, Node};
use std::sync::Arc;

/// What handling a swap packet did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The packet carried newer metadata, which is now stored.
    Adopted,
    /// The requester was behind and has been sent our metadata.
    Responded,
    /// Nothing to do.
    Ignored,
}

/// Swap initiator and responder.
pub struct AntiEntropy {
    membership: Arc<MembershipStore>,
    metadata: Arc<MetadataStore>,
    transport: Arc<dyn Transport>,
    secret_key: String,
    offload: Option<Arc<dyn TargetOffload>>,
}

impl AntiEntropy {
    /// Create the anti-entropy handler.
    pub fn new(
        membership: Arc<MembershipStore>,
        metadata: Arc<MetadataStore>,
        transport: Arc<dyn Transport>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            membership,
            metadata,
            transport,
            secret_key: secret_key.into(),
            offload: None,
        }
    }

    /// Pin adopted metadata versions in an offload program.
    pub fn with_offload(mut self, offload: Arc<dyn TargetOffload>) -> Self {
        self.offload = Some(offload);
        self
    }

    /// Send a swap request to the first live peer.
    ///
    /// Returns the probed peer, or `None` when there is nobody to ask.
    pub async fn initiate(&self) -> GossipResult<Option<Node>> {
        let local = self.membership.local();
        let Some(peer) = self.membership.get().into_iter().find(|n| !n.same_peer(local)) else {
            return Ok(None);
        };

        let packet = Packet::new(self.secret_key.clone(), Message::SwapRequest(self.local_swap()));
        self.transport.send(&peer.addr, peer.port, &packet.to_bytes()?).await?;

        tracing::debug!("Swap request: {} -> {}", local, peer);
        Ok(Some(peer))
    }

    /// Handle an incoming swap request or response.
    ///
    /// Any other message is ignored.
    pub async fn on_swap(&self, message: Message) -> GossipResult<SwapOutcome> {
        let (swap, is_request) = match message {
            Message::SwapRequest(swap) => (swap, true),
            Message::SwapResponse(swap) => (swap, false),
            _ => return Ok(SwapOutcome::Ignored),
        };

        let local_version = self.metadata.version();

        if swap.metadata.update > local_version {
            return Ok(if self.adopt(swap.metadata, &swap.node) {
                SwapOutcome::Adopted
            } else {
                SwapOutcome::Ignored
            });
        }

        if swap.metadata.update < local_version && is_request {
            let packet = Packet::new(self.secret_key.clone(), Message::SwapResponse(self.local_swap()));
            self.transport
                .send(&swap.node.addr, swap.node.port, &packet.to_bytes()?)
                .await?;

            tracing::debug!("Swap response: {} <- {}", swap.node, self.membership.local());
            return Ok(SwapOutcome::Responded);
        }

        if swap.metadata.update == local_version {
            tracing::trace!("Metadata from {} is the same version, skipping", swap.node);
        }
        Ok(SwapOutcome::Ignored)
    }

    /// Store `metadata` if it is newer than ours.
    ///
    /// In offload modes the new version is also pushed to the kernel program.
    /// A failed push is logged; the adoption stands.
    pub fn adopt(&self, metadata: Metadata, from: &Node) -> bool {
        let update = metadata.update;
        if !self.metadata.adopt_if_newer(metadata) {
            return false;
        }

        tracing::info!("Adopted metadata version {} from {}", update, from);
        self.pin_version(update);
        true
    }

    /// Push a metadata version to the offload program, if any.
    pub fn pin_version(&self, update: i64) {
        if let Some(offload) = &self.offload {
            if let Err(e) = offload.push_metadata_version(update) {
                tracing::error!("Failed to push metadata version {}: {}", update, e);
            }
        }
    }

    fn local_swap(&self) -> Swap {
        Swap {
            node: self.membership.local().clone(),
            metadata: Metadata::clone(&self.metadata.current()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, MemoryOffload, MemoryTransport};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct Side {
        node: Node,
        metadata: Arc<MetadataStore>,
        transport: Arc<MemoryTransport>,
        anti_entropy: AntiEntropy,
    }

    fn side(network: &MemoryNetwork, addr: &str, peers: &[&str]) -> Side {
        let node = Node::new(addr, 8000);
        let membership = Arc::new(MembershipStore::new(
            node.clone(),
            Duration::from_secs(30),
            Ipv4Addr::new(255, 255, 255, 0),
            String::new(),
        ));
        for peer in peers {
            membership.set(Node::new(*peer, 8000));
        }
        let metadata = Arc::new(MetadataStore::new());
        let transport = Arc::new(network.endpoint(addr, 8000, 8));
        let anti_entropy = AntiEntropy::new(membership, metadata.clone(), transport.clone(), "k");
        Side {
            node,
            metadata,
            transport,
            anti_entropy,
        }
    }

    async fn deliver(to: &Side) -> SwapOutcome {
        let bytes = to.transport.recv().await.unwrap();
        let packet = Packet::from_bytes(&bytes).unwrap();
        to.anti_entropy.on_swap(packet.message).await.unwrap()
    }

    #[tokio::test]
    async fn test_cfg_v2_scenario() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &["10.0.0.2"]);
        let b = side(&network, "10.0.0.2", &["10.0.0.1"]);
        b.metadata.adopt_if_newer(Metadata::with_update(b"cfg-v2".to_vec(), 500));

        // A probes B with version 0.
        let probed = a.anti_entropy.initiate().await.unwrap();
        assert_eq!(probed, Some(b.node.clone()));

        // B is ahead and the packet is a request, so B answers.
        assert_eq!(deliver(&b).await, SwapOutcome::Responded);

        // A adopts from the response.
        let bytes = a.transport.recv().await.unwrap();
        let response = Packet::from_bytes(&bytes).unwrap();
        assert!(matches!(response.message, Message::SwapResponse(ref s) if s.metadata.update == 500));
        assert_eq!(a.anti_entropy.on_swap(response.message).await.unwrap(), SwapOutcome::Adopted);

        assert_eq!(a.metadata.read(), b"cfg-v2");
        assert_eq!(b.metadata.read(), b"cfg-v2");
    }

    #[tokio::test]
    async fn test_receiver_behind_adopts_without_reply() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &["10.0.0.2"]);
        let b = side(&network, "10.0.0.2", &["10.0.0.1"]);
        a.metadata.adopt_if_newer(Metadata::with_update(b"new".to_vec(), 900));
        b.metadata.adopt_if_newer(Metadata::with_update(b"old".to_vec(), 100));

        a.anti_entropy.initiate().await.unwrap();
        assert_eq!(deliver(&b).await, SwapOutcome::Adopted);
        assert_eq!(b.metadata.read(), b"new");
        assert!(a.transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_equal_versions_ignored() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &["10.0.0.2"]);
        let b = side(&network, "10.0.0.2", &["10.0.0.1"]);

        a.anti_entropy.initiate().await.unwrap();
        assert_eq!(deliver(&b).await, SwapOutcome::Ignored);
        assert!(a.transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_response_is_never_answered() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &["10.0.0.2"]);
        let b = side(&network, "10.0.0.2", &["10.0.0.1"]);
        b.metadata.adopt_if_newer(Metadata::with_update(b"newer".to_vec(), 10));

        let stale = Message::SwapResponse(Swap {
            node: a.node.clone(),
            metadata: Metadata::default(),
        });
        assert_eq!(b.anti_entropy.on_swap(stale).await.unwrap(), SwapOutcome::Ignored);
        assert!(a.transport.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_initiate_without_peers() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &[]);
        assert_eq!(a.anti_entropy.initiate().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_adoption_pins_offload_version() {
        let network = MemoryNetwork::new();
        let offload = Arc::new(MemoryOffload::new());
        let Side { anti_entropy, .. } = side(&network, "10.0.0.1", &[]);
        let anti_entropy = anti_entropy.with_offload(offload.clone());

        assert!(anti_entropy.adopt(Metadata::with_update(b"x".to_vec(), 77), &Node::new("10.0.0.2", 8000)));
        assert_eq!(offload.metadata_version(), 77);
        assert!(!anti_entropy.adopt(Metadata::with_update(b"y".to_vec(), 10), &Node::new("10.0.0.2", 8000)));
        assert_eq!(offload.metadata_version(), 77);
    }

    #[tokio::test]
    async fn test_heartbeats_are_ignored() {
        let network = MemoryNetwork::new();
        let a = side(&network, "10.0.0.1", &[]);
        let hb = Message::Heartbeat(crate::network::Heartbeat::new(Node::new("10.0.0.2", 8000)));
        assert_eq!(a.anti_entropy.on_swap(hb).await.unwrap(), SwapOutcome::Ignored);
    }
}
