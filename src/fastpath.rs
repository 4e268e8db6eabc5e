/// Kernel fast path: batched, offloaded broadcast.
///
/// Instead of sending one copy of a packet per target, the selected targets are
/// registered with a packet-processing program on the egress link under a
/// fresh batch key. The packet goes out once, tagged with that key, and the
/// program clones it to every target in the batch.
///
/// Groups are capped at [`MAX_BATCH_TARGETS`], well under the program's
/// [`MAX_KERNEL_TARGETS`] list capacity. A broadcast to `K` targets therefore
/// costs `ceil(K / 25)` sends.
use crate::allocator::KeyAllocator;
use crate::error::{GossipError, GossipResult};
use crate::network::{Heartbeat, Message, Packet};
use crate::transport::Transport;
use crate::types::{BroadcastTarget, Node};
use std::num::NonZeroU16;
use std::sync::Arc;

/// Most targets registered per batch.
pub const MAX_BATCH_TARGETS: usize = 25;

/// Capacity of the kernel program's per-batch target list.
pub const MAX_KERNEL_TARGETS: usize = 64;

/// The kernel-side collaborator that stores target lists.
///
/// Implementations must fail loudly: a batch that could not be registered must
/// surface as an error, never be silently dropped.
pub trait TargetOffload: Send + Sync {
    /// Register `targets` under `batch`, replacing any previous list for that key.
    fn push_targets(&self, batch: NonZeroU16, targets: &[BroadcastTarget]) -> GossipResult<()>;

    /// Tell the program which metadata version is current.
    fn push_metadata_version(&self, _update: i64) -> GossipResult<()> {
        Ok(())
    }
}

/// Result of a fast-path broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FastPathReport {
    /// Batches registered and sent.
    pub batches: usize,
    /// Targets covered by those batches.
    pub targets: usize,
}

/// Splits a target list into offload batches and sends one packet per batch.
pub struct FastPathBatcher {
    allocator: KeyAllocator,
    offload: Arc<dyn TargetOffload>,
    transport: Arc<dyn Transport>,
    secret_key: String,
}

impl FastPathBatcher {
    /// Create a batcher over an offload program and a transport.
    pub fn new(
        offload: Arc<dyn TargetOffload>,
        transport: Arc<dyn Transport>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            allocator: KeyAllocator::new(),
            offload,
            transport,
            secret_key: secret_key.into(),
        }
    }

    /// Send `heartbeat` to `targets` through the offload program.
    ///
    /// `heartbeat.infected` must already include every target. A registration
    /// failure or a reserved batch key aborts the broadcast before that batch's
    /// packet is sent; batches sent earlier stay sent. A failed send only
    /// loses its own batch.
    pub async fn dispatch(&self, heartbeat: &Heartbeat, targets: &[Node]) -> GossipResult<FastPathReport> {
        let mut report = FastPathReport::default();

        for group in targets.chunks(MAX_BATCH_TARGETS) {
            let batch = NonZeroU16::new(self.allocator.next()).ok_or(GossipError::InvalidBatchKey)?;

            let entries: Vec<BroadcastTarget> = group.iter().map(BroadcastTarget::from).collect();
            self.offload.push_targets(batch, &entries)?;

            let packet = Packet::new(
                self.secret_key.clone(),
                Message::Forward {
                    heartbeat: heartbeat.clone(),
                    mapkey: Some(batch),
                },
            );
            let bytes = packet.to_bytes()?;

            // Non-empty: `chunks` never yields an empty slice.
            let representative = &group[0];
            if let Err(e) = self
                .transport
                .send(&representative.addr, representative.port, &bytes)
                .await
            {
                tracing::debug!("Fast-path batch {} to {} failed: {}", batch, representative, e);
            } else {
                tracing::trace!(
                    "Fast-path batch {} ({} targets) via {}",
                    batch,
                    group.len(),
                    representative
                );
            }

            report.batches += 1;
            report.targets += group.len();
        }

        Ok(report)
    }
}
