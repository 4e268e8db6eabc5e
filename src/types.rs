/// Common types used throughout the gossip engine.
///
/// These are the values that travel on the wire and sit in the stores. They are
/// plain data: nodes are replaced wholesale rather than mutated, and metadata is
/// swapped as a whole value.
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Build the peer identity key used for the infected set and membership lookups.
///
/// Format: "addr:port"
pub fn peer_key(addr: &str, port: u16) -> String {
    format!("{}:{}", addr, port)
}

/// Identity of a cluster member.
///
/// Nodes compare and hash by their full value. In practice `addr` and `port`
/// identify a peer, but other observers may legitimately see different `mac`
/// values (see [`MembershipStore::set`](crate::membership::MembershipStore::set)).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Node {
    /// IP address in textual form (public IP on a public network)
    pub addr: String,
    /// Gossip port
    pub port: u16,
    /// Link-layer address, used by the kernel fast path
    pub mac: String,
    /// Display name
    pub name: String,
    /// Opaque per-node data
    pub private_data: String,
    /// Local link the offload program is attached to (meaningful only to the origin)
    pub link_name: String,
}

impl Node {
    /// Create a node with just an address and port.
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            ..Self::default()
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the link-layer address.
    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = mac.into();
        self
    }

    /// Set the opaque private data.
    pub fn with_private_data(mut self, data: impl Into<String>) -> Self {
        self.private_data = data.into();
        self
    }

    /// Set the local link name.
    pub fn with_link_name(mut self, link: impl Into<String>) -> Self {
        self.link_name = link.into();
        self
    }

    /// The "addr:port" key for this node.
    pub fn key(&self) -> String {
        peer_key(&self.addr, self.port)
    }

    /// Whether `other` refers to the same peer (same address and port).
    pub fn same_peer(&self, other: &Node) -> bool {
        self.addr == other.addr && self.port == other.port
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}:{}", self.addr, self.port)
        } else {
            write!(f, "{}@{}:{}", self.name, self.addr, self.port)
        }
    }
}

/// Cluster-wide shared metadata.
///
/// `update` is the publisher's wall clock in nanoseconds and acts as the
/// version: a node only adopts metadata whose `update` is strictly greater
/// than what it holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Metadata {
    /// Payload length hint
    pub size: usize,
    /// Publication timestamp (nanoseconds since the epoch)
    pub update: i64,
    /// Opaque payload
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Metadata {
    /// Wrap a payload stamped with the current wall clock.
    pub fn new(data: Vec<u8>) -> Self {
        let update = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        Self::with_update(data, update)
    }

    /// Wrap a payload with an explicit version.
    pub fn with_update(data: Vec<u8>, update: i64) -> Self {
        Self {
            size: data.len(),
            update,
            data,
        }
    }

    /// Whether this value should replace `current`.
    pub fn is_newer_than(&self, current: &Metadata) -> bool {
        self.update > current.update
    }
}

/// Set of peer keys already notified within one diffusion wave.
///
/// Carried inside the packet. Keys are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Infected(BTreeMap<String, bool>);

impl Infected {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single node's key.
    pub fn with_node(node: &Node) -> Self {
        let mut set = Self::new();
        set.insert(node);
        set
    }

    /// Mark a node as infected.
    pub fn insert(&mut self, node: &Node) {
        self.0.insert(node.key(), true);
    }

    /// Whether the node has already been notified.
    pub fn contains(&self, node: &Node) -> bool {
        self.contains_key(&node.key())
    }

    /// Whether the key has already been notified.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }

    /// Number of keys marked infected.
    pub fn len(&self) -> usize {
        self.0.values().filter(|v| **v).count()
    }

    /// Whether no key is marked infected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fast-path target: the three values the kernel program needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BroadcastTarget {
    /// Destination IP address
    pub addr: String,
    /// Destination port
    pub port: u16,
    /// Destination (or gateway) link-layer address
    pub mac: String,
}

impl From<&Node> for BroadcastTarget {
    fn from(node: &Node) -> Self {
        Self {
            addr: node.addr.clone(),
            port: node.port,
            mac: node.mac.clone(),
        }
    }
}

/// Byte payloads travel as base64 text inside the JSON envelope.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
