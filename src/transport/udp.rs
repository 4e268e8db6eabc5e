/// UDP transport: one datagram per packet.
use super::{resolve, Transport};
use crate::error::{GossipError, GossipResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// A bound UDP socket used for both directions.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    size: usize,
}

impl UdpTransport {
    /// Bind to an address. Datagrams of `size` bytes or more are rejected.
    pub async fn bind(addr: SocketAddr, size: usize) -> GossipResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| GossipError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            size,
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, addr: &str, port: u16, bytes: &[u8]) -> GossipResult<()> {
        let target = resolve(addr, port)?;
        self.socket
            .send_to(bytes, target)
            .await
            .map_err(|e| GossipError::Transport(format!("Failed to send to {}: {}", target, e)))?;
        Ok(())
    }

    async fn recv(&self) -> GossipResult<Vec<u8>> {
        let mut buf = vec![0u8; self.size];
        let (n, _from) = self.socket.recv_from(&mut buf).await?;

        // A datagram that fills the buffer may have been truncated.
        if n >= self.size {
            return Err(GossipError::Oversized {
                size: n,
                limit: self.size,
            });
        }

        Ok(buf[..n].to_vec())
    }
}
