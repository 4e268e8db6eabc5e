/// Epidemic diffusion of heartbeats.
///
/// A heartbeat wave carries its own [`Infected`] set. Each hop picks up to
/// `amount` live peers that are not yet in the set, adds them, and forwards the
/// packet to them. Since every target is added before it is sent to, no node
/// receives the same wave twice and the wave dies out once every reachable
/// node is infected.
///
/// Dispatch goes either point-to-point through the transport, or through the
/// [`FastPathBatcher`] when the node runs in a kernel-offload mode.
use crate::error::GossipResult;
use crate::fastpath::{FastPathBatcher, FastPathReport};
use crate::membership::MembershipStore;
use crate::network::{Heartbeat, Message, Packet};
use crate::transport::Transport;
use crate::types::{Infected, Node};
use futures::future::join_all;
use std::sync::Arc;

/// Choose up to `amount` targets among `nodes`.
///
/// Iterates in the given order, skipping `local` and every already infected
/// peer, and marks each chosen target infected.
pub fn select_targets(nodes: &[Node], local: &Node, infected: &mut Infected, amount: usize) -> Vec<Node> {
    let mut targets = Vec::with_capacity(amount.min(nodes.len()));

    for node in nodes {
        if targets.len() >= amount {
            break;
        }
        if node.same_peer(local) || infected.contains(node) {
            continue;
        }
        infected.insert(node);
        targets.push(node.clone());
    }

    targets
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers newly infected by this hop.
    pub targets: usize,
    /// Packets handed to the transport.
    pub sends: usize,
}

/// Spreads heartbeats to the membership.
pub struct Diffusion {
    membership: Arc<MembershipStore>,
    transport: Arc<dyn Transport>,
    amount: usize,
    secret_key: String,
    fast_path: Option<FastPathBatcher>,
}

impl Diffusion {
    /// Create a point-to-point diffusion engine.
    pub fn new(
        membership: Arc<MembershipStore>,
        transport: Arc<dyn Transport>,
        amount: usize,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            membership,
            transport,
            amount,
            secret_key: secret_key.into(),
            fast_path: None,
        }
    }

    /// Route broadcasts through the kernel fast path.
    pub fn with_fast_path(mut self, batcher: FastPathBatcher) -> Self {
        self.fast_path = Some(batcher);
        self
    }

    /// Forward `heartbeat` to the next set of uninfected peers.
    ///
    /// Per-target send failures are logged and skipped. On the fast path a
    /// registration failure aborts the broadcast with an error.
    pub async fn broadcast(&self, mut heartbeat: Heartbeat) -> GossipResult<BroadcastReport> {
        let nodes = self.membership.get();
        let targets = select_targets(&nodes, self.membership.local(), &mut heartbeat.infected, self.amount);

        if targets.is_empty() {
            tracing::trace!("Wave from {} has no uninfected peers left", heartbeat.node);
            return Ok(BroadcastReport::default());
        }

        let sends = match &self.fast_path {
            Some(batcher) => {
                let FastPathReport { batches, .. } = batcher.dispatch(&heartbeat, &targets).await?;
                batches
            }
            None => self.send_each(heartbeat, &targets).await?,
        };

        Ok(BroadcastReport {
            targets: targets.len(),
            sends,
        })
    }

    async fn send_each(&self, heartbeat: Heartbeat, targets: &[Node]) -> GossipResult<usize> {
        let packet = Packet::new(
            self.secret_key.clone(),
            Message::Forward {
                heartbeat,
                mapkey: None,
            },
        );
        // Every target gets the same bytes, including the full infected set.
        let bytes = packet.to_bytes()?;

        let sends = targets
            .iter()
            .map(|target| self.transport.send(&target.addr, target.port, &bytes));
        let results = join_all(sends).await;

        for (target, result) in targets.iter().zip(&results) {
            match result {
                Ok(()) => tracing::trace!("Heartbeat forwarded to {}", target),
                Err(e) => tracing::debug!("Failed to forward heartbeat to {}: {}", target, e),
            }
        }

        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastpath::MAX_BATCH_TARGETS;
    use crate::transport::{MemoryNetwork, MemoryOffload, MemoryTransport};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn membership(local: &Node, peers: &[Node]) -> Arc<MembershipStore> {
        let store = MembershipStore::new(
            local.clone(),
            Duration::from_secs(30),
            Ipv4Addr::new(255, 255, 255, 0),
            String::new(),
        );
        for peer in peers {
            store.set(peer.clone());
        }
        Arc::new(store)
    }

    fn node(last: u8) -> Node {
        Node::new(format!("10.0.0.{}", last), 8000)
    }

    fn drain(transport: &MemoryTransport) -> Vec<Packet> {
        std::iter::from_fn(|| transport.try_recv())
            .map(|bytes| Packet::from_bytes(&bytes).unwrap())
            .collect()
    }

    #[test]
    fn test_select_skips_local_and_infected() {
        let local = node(1);
        let nodes = vec![local.clone(), node(2), node(3), node(4)];
        let mut infected = Infected::with_node(&node(3));

        let targets = select_targets(&nodes, &local, &mut infected, 10);

        assert_eq!(targets, vec![node(2), node(4)]);
        assert!(infected.contains(&node(2)));
        assert!(infected.contains(&node(4)));
        // The local node is skipped even when it is missing from the set.
        assert!(!infected.contains(&local));
    }

    #[test]
    fn test_select_caps_at_amount() {
        let local = node(1);
        let nodes: Vec<Node> = (2..=20).map(node).collect();
        let mut infected = Infected::new();

        let targets = select_targets(&nodes, &local, &mut infected, 5);
        assert_eq!(targets.len(), 5);
        assert_eq!(infected.len(), 5);
        assert_eq!(targets, nodes[..5].to_vec());
    }

    #[tokio::test]
    async fn test_amount_two_scenario() {
        let network = MemoryNetwork::new();
        let (a, b, c, d) = (node(1), node(2), node(3), node(4));
        let transport = Arc::new(network.endpoint(&a.addr, 8000, 8));
        let inboxes: Vec<_> = [&b, &c, &d]
            .iter()
            .map(|n| network.endpoint(&n.addr, 8000, 8))
            .collect();

        let diffusion = Diffusion::new(membership(&a, &[b, c, d]), transport, 2, "");
        let heartbeat = Heartbeat {
            infected: Infected::new(),
            ..Heartbeat::new(a.clone())
        };
        let report = diffusion.broadcast(heartbeat).await.unwrap();

        assert_eq!(report, BroadcastReport { targets: 2, sends: 2 });

        let received: Vec<Vec<Packet>> = inboxes.iter().map(drain).collect();
        assert_eq!(received.iter().filter(|r| r.len() == 1).count(), 2);
        assert_eq!(received.iter().filter(|r| r.is_empty()).count(), 1);

        for packet in received.iter().flatten() {
            match &packet.message {
                Message::Forward { heartbeat, mapkey } => {
                    assert!(mapkey.is_none());
                    assert_eq!(heartbeat.infected.len(), 2);
                    assert!(!heartbeat.infected.contains(&a));
                }
                other => panic!("Expected Forward message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_nothing_left_to_infect() {
        let network = MemoryNetwork::new();
        let a = node(1);
        let transport = Arc::new(network.endpoint(&a.addr, 8000, 8));
        let diffusion = Diffusion::new(membership(&a, &[node(2)]), transport, 3, "");

        let mut heartbeat = Heartbeat::new(a);
        heartbeat.infected.insert(&node(2));

        let report = diffusion.broadcast(heartbeat).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(network.delivered(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_does_not_stop_others() {
        let network = MemoryNetwork::new();
        let a = node(1);
        let transport = Arc::new(network.endpoint(&a.addr, 8000, 8));
        let reachable = network.endpoint("10.0.0.3", 8000, 8);
        // 10.0.0.2 has no endpoint, so its packet is dropped.
        let diffusion = Diffusion::new(membership(&a, &[node(2), node(3)]), transport, 5, "");

        let report = diffusion.broadcast(Heartbeat::new(a)).await.unwrap();
        assert_eq!(report.targets, 2);
        assert_eq!(drain(&reachable).len(), 1);
    }

    #[tokio::test]
    async fn test_fast_path_dispatch() {
        let network = MemoryNetwork::new();
        let offload = Arc::new(MemoryOffload::new());
        let a = node(1);
        let transport: Arc<MemoryTransport> = Arc::new(network.endpoint(&a.addr, 8000, 8));
        let peers: Vec<Node> = (2..=41).map(node).collect();

        let batcher = FastPathBatcher::new(offload.clone(), transport.clone(), "");
        let diffusion = Diffusion::new(membership(&a, &peers), transport, 40, "").with_fast_path(batcher);

        let report = diffusion.broadcast(Heartbeat::new(a)).await.unwrap();
        assert_eq!(report.targets, 40);
        assert_eq!(report.sends, 2);
        assert_eq!(offload.batch_count(), 2);
        assert!(offload.batches().iter().all(|(_, t)| t.len() <= MAX_BATCH_TARGETS));
    }
}
