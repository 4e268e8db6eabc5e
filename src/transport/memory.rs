/// In-process network for simulations and tests.
///
/// Endpoints are registered by `addr:port` and exchange bytes over bounded
/// channels. Like a real datagram network, a full inbox or an unknown
/// destination silently drops the packet, and a configurable loss rate drops
/// packets at random.
///
/// An endpoint can also carry a [`MemoryOffload`], in which case it behaves like
/// a link with the fan-out program attached: an outgoing packet tagged with a
/// registered batch key is cloned to every target in that batch.
use super::Transport;
use crate::error::{GossipError, GossipResult};
use crate::fastpath::{TargetOffload, MAX_KERNEL_TARGETS};
use crate::network::{peek_mapkey, COUNT_OFFSET, FRAME_HEADER_LEN};
use crate::types::{peer_key, BroadcastTarget};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug)]
struct Endpoint {
    tx: mpsc::Sender<Vec<u8>>,
    /// Deliver full frames instead of bare payloads.
    frames: bool,
}

#[derive(Debug, Default)]
struct NetworkInner {
    endpoints: DashMap<String, Endpoint>,
    /// Loss rate as `f64` bits.
    loss: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Shared in-memory network. Cloning yields another handle to the same network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Create an empty, lossless network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop each packet with probability `rate` (clamped to `[0, 1]`).
    pub fn set_loss(&self, rate: f64) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        self.inner.loss.store(rate.to_bits(), Ordering::Relaxed);
    }

    /// Current loss rate.
    pub fn loss(&self) -> f64 {
        f64::from_bits(self.inner.loss.load(Ordering::Relaxed))
    }

    /// Register an endpoint receiving bare payloads.
    pub fn endpoint(&self, addr: &str, port: u16, capacity: usize) -> MemoryTransport {
        self.register(addr, port, capacity, false)
    }

    /// Register an endpoint receiving full frames, as a raw-socket listener would.
    pub fn frame_endpoint(&self, addr: &str, port: u16, capacity: usize) -> MemoryTransport {
        self.register(addr, port, capacity, true)
    }

    /// Remove an endpoint. Packets sent to it afterwards are dropped.
    pub fn disconnect(&self, addr: &str, port: u16) {
        self.inner.endpoints.remove(&peer_key(addr, port));
    }

    /// Packets delivered so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Packets dropped so far (loss, full inbox, or unknown destination).
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn register(&self, addr: &str, port: u16, capacity: usize, frames: bool) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let key = peer_key(addr, port);
        self.inner.endpoints.insert(key.clone(), Endpoint { tx, frames });
        MemoryTransport {
            network: self.clone(),
            key,
            rx: Mutex::new(rx),
            offload: None,
        }
    }

    fn deliver(&self, key: &str, bytes: &[u8]) -> bool {
        let loss = self.loss();
        if loss > 0.0 && rand::thread_rng().gen_bool(loss) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Memory network lost packet to {}", key);
            return false;
        }

        let sent = match self.inner.endpoints.get(key) {
            Some(endpoint) => {
                let unit = if endpoint.frames {
                    let mut frame = vec![0u8; FRAME_HEADER_LEN];
                    frame.extend_from_slice(bytes);
                    frame
                } else {
                    bytes.to_vec()
                };
                endpoint.tx.try_send(unit).is_ok()
            }
            None => false,
        };

        let counter = if sent { &self.inner.delivered } else { &self.inner.dropped };
        counter.fetch_add(1, Ordering::Relaxed);
        sent
    }
}

/// One node's attachment to a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    key: String,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    offload: Option<Arc<MemoryOffload>>,
}

impl MemoryTransport {
    /// Attach a fan-out program to this endpoint's egress.
    pub fn with_offload(mut self, offload: Arc<MemoryOffload>) -> Self {
        self.offload = Some(offload);
        self
    }

    /// The `addr:port` this endpoint is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Take a pending unit without waiting.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    fn replicate(&self, offload: &MemoryOffload, bytes: &[u8]) -> Option<usize> {
        let targets = offload.batch(peek_mapkey(bytes)?)?;
        for (i, target) in targets.iter().enumerate() {
            let mut replica = bytes.to_vec();
            // The program stamps each clone with its index.
            if replica.len() > COUNT_OFFSET && replica[COUNT_OFFSET].is_ascii_digit() {
                replica[COUNT_OFFSET] = b'0' + ((i + 1) % 10) as u8;
            }
            self.network.deliver(&peer_key(&target.addr, target.port), &replica);
        }
        Some(targets.len())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, addr: &str, port: u16, bytes: &[u8]) -> GossipResult<()> {
        if let Some(offload) = &self.offload {
            if let Some(copies) = self.replicate(offload, bytes) {
                tracing::trace!("Replicated packet from {} to {} targets", self.key, copies);
                return Ok(());
            }
        }
        self.network.deliver(&peer_key(addr, port), bytes);
        Ok(())
    }

    async fn recv(&self) -> GossipResult<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| GossipError::Transport(format!("Endpoint {} disconnected", self.key)))
    }
}

/// In-memory stand-in for the kernel program's maps.
#[derive(Debug, Default)]
pub struct MemoryOffload {
    batches: DashMap<NonZeroU16, Vec<BroadcastTarget>>,
    metadata_version: AtomicI64,
}

impl MemoryOffload {
    /// Create empty maps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets registered under `batch`.
    pub fn batch(&self, batch: NonZeroU16) -> Option<Vec<BroadcastTarget>> {
        self.batches.get(&batch).map(|entry| entry.value().clone())
    }

    /// Every registered batch.
    pub fn batches(&self) -> Vec<(NonZeroU16, Vec<BroadcastTarget>)> {
        self.batches
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Number of registered batches.
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    /// Last pinned metadata version.
    pub fn metadata_version(&self) -> i64 {
        self.metadata_version.load(Ordering::Acquire)
    }
}

impl TargetOffload for MemoryOffload {
    fn push_targets(&self, batch: NonZeroU16, targets: &[BroadcastTarget]) -> GossipResult<()> {
        if targets.len() > MAX_KERNEL_TARGETS {
            return Err(GossipError::TooManyTargets {
                count: targets.len(),
                max: MAX_KERNEL_TARGETS,
            });
        }
        self.batches.insert(batch, targets.to_vec());
        Ok(())
    }

    fn push_metadata_version(&self, update: i64) -> GossipResult<()> {
        self.metadata_version.store(update, Ordering::Release);
        Ok(())
    }
}
