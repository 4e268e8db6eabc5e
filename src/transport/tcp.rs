/// TCP transport.
///
/// Each packet travels on its own connection: the sender connects, writes the
/// encoded packet, and closes its write half. The receiver reads until EOF, so
/// no length header is needed.
///
/// Every accepted connection is read on its own task, so an idle or slow peer
/// only holds up its own packet.
use super::{resolve, Transport};
use crate::error::{GossipError, GossipResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

/// How long to wait for a connection to be established.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a peer may take to deliver its packet once connected.
const READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Packets read but not yet taken by `recv`.
const INBOX_CAPACITY: usize = 64;

/// TCP listener for incoming packets, also used to send outgoing ones.
#[derive(Debug)]
pub struct TcpTransport {
    inbox: Mutex<mpsc::Receiver<GossipResult<Vec<u8>>>>,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind to an address and start accepting connections.
    ///
    /// The accept loop runs until the transport is dropped.
    pub async fn bind(addr: SocketAddr, size: usize) -> GossipResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GossipError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(accept_loop(listener, size, tx));

        Ok(Self {
            inbox: Mutex::new(rx),
            local_addr,
        })
    }

    /// Get the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(listener: TcpListener, size: usize, tx: mpsc::Sender<GossipResult<Vec<u8>>>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let unit = match result {
                    Ok((stream, peer_addr)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(read_packet(stream, peer_addr, size).await).await;
                        });
                        continue;
                    }
                    Err(e) => Err(GossipError::Transport(format!("Failed to accept connection: {}", e))),
                };
                if tx.send(unit).await.is_err() {
                    break;
                }
            }
            _ = tx.closed() => break,
        }
    }
    tracing::trace!("TCP accept loop on {:?} exited", listener.local_addr().ok());
}

async fn read_packet(stream: TcpStream, peer_addr: SocketAddr, size: usize) -> GossipResult<Vec<u8>> {
    let mut bytes = Vec::new();
    // One byte past the limit is enough to tell an oversized body apart.
    let mut body = stream.take(size as u64 + 1);

    timeout(READ_TIMEOUT, body.read_to_end(&mut bytes))
        .await
        .map_err(|_| GossipError::Transport(format!("Timed out reading from {}", peer_addr)))??;

    if bytes.len() >= size {
        return Err(GossipError::Oversized {
            size: bytes.len(),
            limit: size,
        });
    }
    if bytes.is_empty() {
        return Err(GossipError::Transport(format!(
            "Connection from {} closed without data",
            peer_addr
        )));
    }
    Ok(bytes)
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, addr: &str, port: u16, bytes: &[u8]) -> GossipResult<()> {
        let target = resolve(addr, port)?;

        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(target))
            .await
            .map_err(|_| GossipError::Transport(format!("Timed out connecting to {}", target)))?
            .map_err(|e| GossipError::Transport(format!("Failed to connect to {}: {}", target, e)))?;

        stream
            .write_all(bytes)
            .await
            .map_err(|e| GossipError::Transport(format!("Failed to write packet: {}", e)))?;

        stream
            .shutdown()
            .await
            .map_err(|e| GossipError::Transport(format!("Failed to close stream: {}", e)))?;

        Ok(())
    }

    async fn recv(&self) -> GossipResult<Vec<u8>> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| GossipError::Transport("TCP accept loop stopped".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn localhost() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_listener_and_connection() {
        let server = TcpTransport::bind(localhost(), 1024).await.unwrap();
        let client = TcpTransport::bind(localhost(), 1024).await.unwrap();
        let port = server.local_addr().port();

        let send = tokio::spawn(async move { client.send("127.0.0.1", port, b"ping").await });

        assert_eq!(server.recv().await.unwrap(), b"ping");
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = TcpTransport::bind(localhost(), 16).await.unwrap();
        let client = TcpTransport::bind(localhost(), 1024).await.unwrap();
        let port = server.local_addr().port();

        let send = tokio::spawn(async move { client.send("127.0.0.1", port, &[b'x'; 100]).await });

        assert!(matches!(
            server.recv().await,
            Err(GossipError::Oversized { limit: 16, .. })
        ));
        let _ = send.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_others() {
        let server = TcpTransport::bind(localhost(), 1024).await.unwrap();
        let client = TcpTransport::bind(localhost(), 1024).await.unwrap();
        let port = server.local_addr().port();

        // Connects first and never writes.
        let _idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        client.send("127.0.0.1", port, b"hello").await.unwrap();
        let received = timeout(Duration::from_millis(500), server.recv())
            .await
            .expect("packet stuck behind idle connection");

        assert_eq!(received.unwrap(), b"hello");
        assert!(started.elapsed() < READ_TIMEOUT);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = TcpTransport::bind(localhost(), 1024).await.unwrap();
        // Bind and drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind(localhost()).await.unwrap();
            listener.local_addr().unwrap().port()
        };

        assert!(matches!(
            client.send("127.0.0.1", port, b"ping").await,
            Err(GossipError::Transport(_))
        ));
    }
}
