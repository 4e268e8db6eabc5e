/// Transports move encoded packets between nodes.
///
/// The gossip engine only needs two primitives: send one encoded packet to an
/// `addr:port`, and wait for the next inbound unit. What an "inbound unit" is
/// depends on the mode: a datagram for UDP, the body of one connection for
/// TCP, a full link-layer frame in XDP mode.
use crate::error::{GossipError, GossipResult};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};

pub mod memory;
pub mod tcp;
pub mod udp;

pub use memory::{MemoryNetwork, MemoryOffload, MemoryTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// A way to exchange packet bytes with other nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encoded packet to `addr:port`.
    async fn send(&self, addr: &str, port: u16, bytes: &[u8]) -> GossipResult<()>;

    /// Wait for the next inbound unit.
    ///
    /// Errors here are per-unit: the caller logs them and keeps receiving.
    async fn recv(&self) -> GossipResult<Vec<u8>>;
}

/// Resolve a textual address and port to a socket address.
pub fn resolve(addr: &str, port: u16) -> GossipResult<SocketAddr> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|e| GossipError::Transport(format!("Invalid address '{}': {}", addr, e)))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("127.0.0.1", 8000).unwrap().port(), 8000);
        assert!(resolve("::1", 9000).unwrap().is_ipv6());
        assert!(matches!(resolve("not-an-ip", 1), Err(GossipError::Transport(_))));
    }
}
