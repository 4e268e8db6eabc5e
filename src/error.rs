/// Error types for gossip operations.
///
/// Per-packet failures (decode errors, oversized datagrams, failed sends) are
/// recoverable and only ever abort the processing of that one packet. Fast-path
/// registration failures abort the current broadcast attempt. Nothing in this
/// hierarchy is meant to take down the listener or consumer loops.
use thiserror::Error;

/// The main error type for gossip operations.
#[derive(Error, Debug)]
pub enum GossipError {
    /// Packet bytes could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A decoded packet is structurally valid JSON but not a valid message.
    #[error("Invalid packet: {reason}")]
    InvalidPacket {
        /// Why the packet was rejected
        reason: String,
    },

    /// An inbound unit did not fit in the receive buffer.
    #[error("Datagram too large: {size} bytes (limit: {limit})")]
    Oversized {
        /// Bytes received
        size: usize,
        /// Configured receive buffer size
        limit: usize,
    },

    /// The kernel offload collaborator refused a target list.
    #[error("Failed to register batch {batch} with offload: {reason}")]
    Offload {
        /// Batch id that was being registered
        batch: u16,
        /// Collaborator-provided reason
        reason: String,
    },

    /// The key allocator produced the reserved value `0`.
    #[error("Key allocator returned reserved batch key 0")]
    InvalidBatchKey,

    /// A target list exceeds what the kernel program can hold.
    #[error("Too many targets: {count} (max: {max})")]
    TooManyTargets {
        /// Number of targets supplied
        count: usize,
        /// Capacity of the kernel target list
        max: usize,
    },

    /// Sending or receiving through a transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Underlying socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The heartbeat task is already running.
    #[error("Heartbeat task already running")]
    AlreadyRunning,

    /// An operation that needs the background tasks was called before `join()`.
    #[error("Node has not joined the cluster")]
    NotJoined,

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration
        reason: String,
    },
}

/// Result type alias for gossip operations.
pub type GossipResult<T> = Result<T, GossipError>;
