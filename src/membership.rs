/// Membership store: the registry of known peers.
///
/// Each entry is a [`Node`] value mapped to the epoch second it was last seen.
/// There is no background sweeper. Expired entries are evicted by [`get`]
/// itself, so a node that has gone quiet disappears the first time someone
/// looks at the membership after its TTL has passed.
///
/// The store is built from the local identity, so it is never observed
/// without one.
///
/// [`get`]: MembershipStore::get
use crate::types::Node;
use chrono::Utc;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Address stored for nodes that did not announce one.
pub const UNSPECIFIED_ADDR: &str = "0.0.0.0";

/// Concurrent registry of known peers with lazy TTL eviction.
#[derive(Debug)]
pub struct MembershipStore {
    /// Node value -> last seen (epoch seconds).
    nodes: DashMap<Node, i64>,
    /// This node's identity.
    local: Node,
    /// Entries older than this are evicted on read.
    timeout: Duration,
    /// Mask for the subnet predicate.
    subnet_mask: Ipv4Addr,
    /// Link-layer address substituted for off-subnet peers.
    gateway_mac: String,
}

impl MembershipStore {
    /// Create a store seeded with the local node.
    pub fn new(mut local: Node, timeout: Duration, subnet_mask: Ipv4Addr, gateway_mac: String) -> Self {
        if local.addr.is_empty() {
            local.addr = UNSPECIFIED_ADDR.to_string();
        }
        let nodes = DashMap::new();
        nodes.insert(local.clone(), Utc::now().timestamp());
        Self {
            nodes,
            local,
            timeout,
            subnet_mask,
            gateway_mac,
        }
    }

    /// This node's identity.
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Insert a node or refresh its last-seen time.
    ///
    /// Peers outside the local subnet are reached through the gateway, so
    /// their link-layer address is replaced with the gateway's before storing.
    /// Returns `true` if this node value was not present before.
    pub fn set(&self, node: Node) -> bool {
        self.set_seen_at(node, Utc::now().timestamp())
    }

    /// Refresh the local node's entry.
    pub fn touch_local(&self) {
        self.nodes.insert(self.local.clone(), Utc::now().timestamp());
    }

    pub(crate) fn set_seen_at(&self, mut node: Node, seen_at: i64) -> bool {
        if node.addr.is_empty() {
            node.addr = UNSPECIFIED_ADDR.to_string();
        }
        if !same_subnet(&node.addr, &self.local.addr, self.subnet_mask) {
            node.mac = self.gateway_mac.clone();
        }
        self.nodes.insert(node, seen_at).is_none()
    }

    /// Return all live nodes, evicting the expired ones.
    ///
    /// No ordering is guaranteed.
    pub fn get(&self) -> Vec<Node> {
        let now = Utc::now().timestamp();
        let ttl = self.timeout.as_secs() as i64;
        let mut live = Vec::with_capacity(self.nodes.len());

        self.nodes.retain(|node, last_seen| {
            if now - *last_seen > ttl {
                tracing::warn!("Membership timeout: {} has been evicted", node);
                false
            } else {
                live.push(node.clone());
                true
            }
        });

        live
    }

    /// Live nodes other than the local one.
    pub fn peers(&self) -> Vec<Node> {
        self.get()
            .into_iter()
            .filter(|node| !node.same_peer(&self.local))
            .collect()
    }

    /// Whether this exact node value is stored (expired or not).
    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains_key(node)
    }

    /// Number of stored entries, including ones not yet evicted.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Whether two addresses share an IPv4 network under `mask`.
///
/// IPv4-mapped IPv6 addresses count as IPv4. An IPv4 address never shares a
/// subnet with anything else, so a peer reached over IPv6 from an IPv4 node
/// gets the gateway's link-layer address. Two addresses that are both outside
/// IPv4 are treated as the same subnet.
pub fn same_subnet(a: &str, b: &str, mask: Ipv4Addr) -> bool {
    match (as_ipv4(a), as_ipv4(b)) {
        (Some(a), Some(b)) => {
            let mask = u32::from(mask);
            u32::from(a) & mask == u32::from(b) & mask
        }
        (None, None) => true,
        _ => false,
    }
}

fn as_ipv4(addr: &str) -> Option<Ipv4Addr> {
    match addr.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}
