/// The gossip node: stores, engines and background tasks wired together.
///
/// A joined node runs three tasks:
///
/// - **heartbeat**: once per cycle, refresh self, broadcast a heartbeat wave
///   and probe one peer with an anti-entropy swap request;
/// - **listener**: read inbound units from the transport into a bounded queue;
/// - **consumer**: decode queued units, check the cluster secret, then either
///   answer a swap or record the sender and carry its heartbeat wave onward.
///
/// The listener blocks when the queue is full, which in turn stalls transport
/// reads. Memory stays bounded at the price of latency under load.
///
/// # Lifecycle
///
/// `join()` starts all three tasks. `stop()` and `start()` only pause and
/// resume the heartbeat task: a stopped node still answers and forwards.
/// `shutdown()` ends everything.
use crate::anti_entropy::{AntiEntropy, SwapOutcome};
use crate::config::{GossipConfig, TransportMode};
use crate::diffusion::Diffusion;
use crate::error::{GossipError, GossipResult};
use crate::fastpath::{FastPathBatcher, TargetOffload};
use crate::membership::MembershipStore;
use crate::metadata::MetadataStore;
use crate::network::{strip_frame, Heartbeat, Message, Packet};
use crate::transport::Transport;
use crate::types::{Metadata, Node};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Pause after a transport-level receive failure before reading again.
const RECV_BACKOFF: Duration = Duration::from_millis(50);

/// Snapshot of a node's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipStatus {
    /// This node.
    pub local: Node,
    /// Live peers, excluding this node.
    pub peer_count: usize,
    /// Whether the heartbeat task is running.
    pub running: bool,
    /// Version of the stored metadata.
    pub metadata_update: i64,
    /// Transport mode.
    pub mode: TransportMode,
}

/// Shared state reachable from every task.
struct NodeInner {
    membership: Arc<MembershipStore>,
    metadata: Arc<MetadataStore>,
    diffusion: Diffusion,
    anti_entropy: AntiEntropy,
    transport: Arc<dyn Transport>,
    secret_key: String,
    mode: TransportMode,
}

impl NodeInner {
    /// One heartbeat cycle.
    async fn beat(&self) {
        self.membership.touch_local();

        let heartbeat = Heartbeat::new(self.membership.local().clone());
        if let Err(e) = self.diffusion.broadcast(heartbeat).await {
            tracing::error!("Heartbeat broadcast aborted: {}", e);
        }

        if let Err(e) = self.anti_entropy.initiate().await {
            tracing::debug!("Swap request failed: {}", e);
        }
    }

    /// Process one inbound unit. Never fails: bad units are logged and dropped.
    async fn handle(&self, bytes: Vec<u8>) {
        let payload = if self.mode.receives_frames() {
            match strip_frame(&bytes) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!("Dropping frame: {}", e);
                    return;
                }
            }
        } else {
            bytes
        };

        let packet = match Packet::from_bytes(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Failed to decode packet: {}", e);
                tracing::trace!("Undecodable packet: {}", String::from_utf8_lossy(&payload));
                return;
            }
        };

        if packet.secret_key != self.secret_key {
            tracing::warn!("Secret key mismatch, dropping packet from {}", packet.message.sender());
            return;
        }

        match packet.message {
            swap @ (Message::SwapRequest(_) | Message::SwapResponse(_)) => {
                match self.anti_entropy.on_swap(swap).await {
                    Ok(SwapOutcome::Adopted) => {
                        tracing::debug!("Metadata repaired by swap, now at {}", self.metadata.version())
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Failed to answer swap: {}", e),
                }
            }
            Message::Heartbeat(heartbeat) | Message::Forward { heartbeat, .. } => {
                if heartbeat.is_update {
                    self.anti_entropy.adopt(heartbeat.metadata.clone(), &heartbeat.node);
                }
                if self.membership.set(heartbeat.node.clone()) {
                    tracing::info!("Discovered {}", heartbeat.node);
                }
                if let Err(e) = self.diffusion.broadcast(heartbeat).await {
                    tracing::error!("Forward aborted: {}", e);
                }
            }
        }
    }
}

/// A member of a gossip cluster.
pub struct GossipNode {
    /// Normalized configuration.
    config: GossipConfig,
    /// Stores and engines.
    inner: Arc<NodeInner>,
    /// Stops the heartbeat task.
    stop_tx: broadcast::Sender<()>,
    /// Stops every task.
    shutdown_tx: broadcast::Sender<()>,
    /// Whether the heartbeat task is running.
    running: Arc<RwLock<bool>>,
    /// Whether the listener and consumer are running.
    joined: Arc<RwLock<bool>>,
    /// Bumped on every start and stop; a heartbeat task exits once it is stale.
    generation: Arc<AtomicU64>,
}

impl GossipNode {
    /// Create a node using point-to-point dispatch.
    ///
    /// Fails with [`GossipError::InvalidConfig`] if the configured mode needs
    /// an offload program; use [`GossipNode::with_offload`] for those.
    pub fn new(local: Node, config: GossipConfig, transport: Arc<dyn Transport>) -> GossipResult<Self> {
        Self::build(local, config, transport, None)
    }

    /// Create a node whose broadcasts go through a kernel offload program.
    ///
    /// The offload is only used when the configured mode is `Tc` or `Xdp`.
    pub fn with_offload(
        local: Node,
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        offload: Arc<dyn TargetOffload>,
    ) -> GossipResult<Self> {
        Self::build(local, config, transport, Some(offload))
    }

    fn build(
        local: Node,
        config: GossipConfig,
        transport: Arc<dyn Transport>,
        offload: Option<Arc<dyn TargetOffload>>,
    ) -> GossipResult<Self> {
        let config = config.normalized()?;

        let offload = match (config.mode.is_offload(), offload) {
            (true, None) => {
                return Err(GossipError::InvalidConfig {
                    reason: format!("{} mode needs an offload program", config.mode),
                })
            }
            (true, offload) => offload,
            (false, _) => None,
        };

        let membership = Arc::new(MembershipStore::new(
            local,
            config.timeout,
            config.subnet_mask,
            config.gateway_mac.clone(),
        ));
        let metadata = Arc::new(MetadataStore::new());

        let mut diffusion = Diffusion::new(
            Arc::clone(&membership),
            Arc::clone(&transport),
            config.amount,
            config.secret_key.clone(),
        );
        let mut anti_entropy = AntiEntropy::new(
            Arc::clone(&membership),
            Arc::clone(&metadata),
            Arc::clone(&transport),
            config.secret_key.clone(),
        );
        if let Some(offload) = offload {
            let batcher = FastPathBatcher::new(
                Arc::clone(&offload),
                Arc::clone(&transport),
                config.secret_key.clone(),
            );
            diffusion = diffusion.with_fast_path(batcher);
            anti_entropy = anti_entropy.with_offload(offload);
        }

        let inner = NodeInner {
            membership,
            metadata,
            diffusion,
            anti_entropy,
            transport,
            secret_key: config.secret_key.clone(),
            mode: config.mode,
        };

        let (stop_tx, _) = broadcast::channel(1);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            inner: Arc::new(inner),
            stop_tx,
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            joined: Arc::new(RwLock::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// This node's identity.
    pub fn local(&self) -> &Node {
        self.inner.membership.local()
    }

    /// The normalized configuration.
    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// Check if the heartbeat task is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Join the cluster: start the listener, consumer and heartbeat tasks.
    ///
    /// Peers are found through inbound heartbeats, so at least one side needs
    /// a seed entry (see [`GossipNode::set`]).
    pub async fn join(&self) -> GossipResult<()> {
        {
            let mut joined = self.joined.write().await;
            if *joined {
                return Err(GossipError::AlreadyRunning);
            }
            *joined = true;
        }

        let (queue_tx, mut queue_rx) = mpsc::channel::<Vec<u8>>(self.config.buffer);

        // Spawn the listener.
        let transport = Arc::clone(&self.inner.transport);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = transport.recv() => match result {
                        Ok(bytes) => {
                            if queue_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e @ (GossipError::Oversized { .. } | GossipError::InvalidPacket { .. })) => {
                            tracing::debug!("Dropped inbound unit: {}", e);
                        }
                        Err(e) => {
                            tracing::debug!("Receive failed: {}", e);
                            sleep(RECV_BACKOFF).await;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        // Spawn the consumer.
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    bytes = queue_rx.recv() => match bytes {
                        Some(bytes) => inner.handle(bytes).await,
                        None => break,
                    },
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        tracing::info!("{} joined ({} mode)", self.local(), self.config.mode);
        self.start().await
    }

    /// Start (or restart) the heartbeat task.
    pub async fn start(&self) -> GossipResult<()> {
        if !*self.joined.read().await {
            return Err(GossipError::NotJoined);
        }

        let generation = {
            let mut running = self.running.write().await;
            if *running {
                return Err(GossipError::AlreadyRunning);
            }
            *running = true;
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };

        let inner = Arc::clone(&self.inner);
        let current = Arc::clone(&self.generation);
        let cycle = self.config.cycle;
        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(cycle);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if current.load(Ordering::Acquire) != generation {
                            break;
                        }
                        inner.beat().await;
                    }
                    _ = stop_rx.recv() => {
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
            tracing::debug!("Heartbeat task {} exited", generation);
        });

        tracing::debug!("Heartbeat task {} started", generation);
        Ok(())
    }

    /// Stop the heartbeat task. The node keeps receiving and forwarding.
    pub async fn stop(&self) -> GossipResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;
        self.generation.fetch_add(1, Ordering::AcqRel);

        // Send stop signal.
        let _ = self.stop_tx.send(());
        tracing::info!("{} stopped heartbeats", self.local());
        Ok(())
    }

    /// Stop every task.
    pub async fn shutdown(&self) -> GossipResult<()> {
        self.stop().await?;

        let mut joined = self.joined.write().await;
        if *joined {
            *joined = false;
            let _ = self.shutdown_tx.send(());
            tracing::info!("{} left the cluster", self.local());
        }
        Ok(())
    }

    /// Publish new metadata to the whole cluster.
    ///
    /// Stores the payload locally with a fresh version, then broadcasts a
    /// heartbeat carrying it.
    pub async fn publish(&self, data: Vec<u8>) -> GossipResult<Metadata> {
        self.inner.membership.touch_local();

        let metadata = self.inner.metadata.publish(data);
        self.inner.anti_entropy.pin_version(metadata.update);
        tracing::info!(
            "Published metadata version {} ({} bytes)",
            metadata.update,
            metadata.size
        );

        let heartbeat = Heartbeat::update(self.local().clone(), metadata.clone());
        self.inner.diffusion.broadcast(heartbeat).await?;
        Ok(metadata)
    }

    /// The stored metadata payload.
    pub fn read(&self) -> Vec<u8> {
        self.inner.metadata.read()
    }

    /// The stored metadata, including its version.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.inner.metadata.current()
    }

    /// Add a node to the membership by hand, e.g. a bootstrap peer.
    pub fn set(&self, node: Node) -> bool {
        self.inner.membership.set(node)
    }

    /// All live nodes, including this one.
    pub fn nodes(&self) -> Vec<Node> {
        self.inner.membership.get()
    }

    /// Live nodes other than this one.
    pub fn peers(&self) -> Vec<Node> {
        self.inner.membership.peers()
    }

    /// Get the node status.
    pub async fn status(&self) -> GossipStatus {
        GossipStatus {
            local: self.local().clone(),
            peer_count: self.peers().len(),
            running: self.is_running().await,
            metadata_update: self.inner.metadata.version(),
            mode: self.config.mode,
        }
    }
}

impl Drop for GossipNode {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
