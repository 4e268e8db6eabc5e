/// Configuration for a gossip node.
///
/// Unset values fall back to defaults, and a few defaults are derived from
/// other fields (`buffer` from `amount`, `timeout` from `cycle`). Call
/// [`GossipConfig::normalized`] to apply them; [`GossipNode::new`] does this
/// for you.
///
/// [`GossipNode::new`]: crate::cluster::GossipNode::new
use crate::error::{GossipError, GossipResult};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// Default gossip port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default fan-out per hop.
pub const DEFAULT_AMOUNT: usize = 30;

/// Default heartbeat cycle.
pub const DEFAULT_CYCLE: Duration = Duration::from_secs(6);

/// Default maximum packet size in bytes.
pub const DEFAULT_PACKET_SIZE: usize = 16384;

/// Default subnet mask used to decide whether a peer sits behind the gateway.
pub const DEFAULT_SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// How packets leave (and enter) this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Plain UDP datagrams, one send per target.
    #[default]
    Udp,
    /// One TCP connection per message, one send per target.
    Tcp,
    /// UDP receive with kernel fan-out on egress.
    Tc,
    /// Raw frame receive with kernel fan-out on egress.
    Xdp,
}

impl TransportMode {
    /// Whether broadcasts go through the kernel fast path.
    pub fn is_offload(&self) -> bool {
        matches!(self, TransportMode::Tc | TransportMode::Xdp)
    }

    /// Whether inbound units are full link-layer frames.
    pub fn receives_frames(&self) -> bool {
        matches!(self, TransportMode::Xdp)
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportMode::Udp => "UDP",
            TransportMode::Tcp => "TCP",
            TransportMode::Tc => "TC",
            TransportMode::Xdp => "XDP",
        };
        f.write_str(name)
    }
}

impl FromStr for TransportMode {
    type Err = GossipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportMode::Udp),
            "TCP" => Ok(TransportMode::Tcp),
            "TC" => Ok(TransportMode::Tc),
            "XDP" => Ok(TransportMode::Xdp),
            other => Err(GossipError::InvalidConfig {
                reason: format!("unknown transport mode '{}' (expected UDP, TCP, TC or XDP)", other),
            }),
        }
    }
}

/// Configuration for a gossip node.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Address to listen on (default: the local node's address).
    pub listen_addr: Option<IpAddr>,
    /// Maximum number of new peers contacted per hop (default: 30).
    pub amount: usize,
    /// Heartbeat cycle (default: 6 seconds).
    pub cycle: Duration,
    /// Inbound queue capacity (default: 3 x amount).
    pub buffer: usize,
    /// Maximum single packet size in bytes (default: 16384).
    pub size: usize,
    /// Membership TTL (default: 5 x cycle + 2 seconds when not above `cycle`).
    pub timeout: Duration,
    /// Shared cluster secret, stored hashed.
    pub secret_key: String,
    /// Transport mode (default: UDP).
    pub mode: TransportMode,
    /// Mask used by the subnet predicate (default: 255.255.255.0).
    pub subnet_mask: Ipv4Addr,
    /// Link-layer address of the local gateway, used for off-subnet peers.
    pub gateway_mac: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: None,
            amount: DEFAULT_AMOUNT,
            cycle: DEFAULT_CYCLE,
            buffer: 0,
            size: DEFAULT_PACKET_SIZE,
            timeout: Duration::ZERO,
            secret_key: String::new(),
            mode: TransportMode::Udp,
            subnet_mask: DEFAULT_SUBNET_MASK,
            gateway_mac: String::new(),
        }
    }
}

impl GossipConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: IpAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set the fan-out per hop.
    pub fn amount(mut self, amount: usize) -> Self {
        self.amount = amount;
        self
    }

    /// Set the heartbeat cycle.
    pub fn cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    /// Set the inbound queue capacity.
    pub fn buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Set the maximum packet size.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the membership TTL.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the cluster secret. The plain text is hashed immediately.
    pub fn secret_key(mut self, secret: &str) -> Self {
        self.secret_key = hash_secret(secret);
        self
    }

    /// Set the transport mode.
    pub fn mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the subnet mask used for gateway detection.
    pub fn subnet_mask(mut self, mask: Ipv4Addr) -> Self {
        self.subnet_mask = mask;
        self
    }

    /// Set the gateway link-layer address.
    pub fn gateway_mac(mut self, mac: impl Into<String>) -> Self {
        self.gateway_mac = mac.into();
        self
    }

    /// Apply derived defaults and reject unusable values.
    pub fn normalized(mut self) -> GossipResult<Self> {
        if self.amount == 0 {
            self.amount = DEFAULT_AMOUNT;
        }
        if self.cycle.is_zero() {
            self.cycle = DEFAULT_CYCLE;
        }
        if self.buffer == 0 {
            self.buffer = self.amount * 3;
        }
        if self.size == 0 {
            self.size = DEFAULT_PACKET_SIZE;
        }
        if self.timeout <= self.cycle {
            self.timeout = self.cycle * 5 + Duration::from_secs(2);
        }
        if self.size < 64 {
            return Err(GossipError::InvalidConfig {
                reason: format!("packet size {} is too small to hold a packet", self.size),
            });
        }
        Ok(self)
    }
}

/// Hash a plain-text secret the way it travels on the wire.
///
/// An empty secret stays empty so that unsecured clusters compare equal.
pub fn hash_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(secret.as_bytes()))
}
