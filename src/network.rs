/// Protocol messages and their wire encoding.
///
/// Every unit on the wire is a single JSON object with a `Type` tag:
///
/// | Type | Meaning |
/// |------|---------|
/// | 0 | heartbeat |
/// | 1 | heartbeat being forwarded (optionally tagged with a fast-path `Mapkey`) |
/// | 2 | anti-entropy swap request |
/// | 3 | anti-entropy swap response |
///
/// Inside the crate a packet is a [`Packet`] envelope around the [`Message`]
/// enum, so a swap can never carry an infected set and a heartbeat can never
/// carry a batch key. [`WirePacket`] is the flat serde view of the same data.
///
/// # Fixed offsets
///
/// The kernel fan-out program does not parse JSON. It reads the batch key as
/// three ASCII digits at byte [`MAPKEY_OFFSET`] of the payload, and rewrites
/// the `Count` digit at [`COUNT_OFFSET`] on each replica. Both only hold
/// because the encoder always emits `Type`, `Count` and `Mapkey` first, with
/// single-digit `Type`/`Count` and a three-digit key.
use crate::error::{GossipError, GossipResult};
use crate::types::{Infected, Metadata, Node};
use serde::{Deserialize, Deserializer, Serialize};
use std::num::NonZeroU16;

/// Wire tag of a heartbeat.
pub const TYPE_HEARTBEAT: u8 = 0;
/// Wire tag of a forwarded heartbeat.
pub const TYPE_FORWARD: u8 = 1;
/// Wire tag of a swap request.
pub const TYPE_SWAP_REQUEST: u8 = 2;
/// Wire tag of a swap response.
pub const TYPE_SWAP_RESPONSE: u8 = 3;

/// Payload offset of the first batch key digit.
pub const MAPKEY_OFFSET: usize = 29;

/// Payload offset of the `Count` digit.
pub const COUNT_OFFSET: usize = 18;

/// Ethernet (14) + IPv4 (20) + UDP (8) header bytes in front of a raw frame's payload.
pub const FRAME_HEADER_LEN: usize = 42;

/// A heartbeat: "this node is alive", optionally carrying new metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Originator of the wave.
    pub node: Node,
    /// Peers already notified in this wave.
    pub infected: Infected,
    /// Metadata carried along (authoritative only when `is_update` is set).
    pub metadata: Metadata,
    /// Whether `metadata` is a fresh publication.
    pub is_update: bool,
}

impl Heartbeat {
    /// A plain liveness heartbeat from `node`, with `node` already infected.
    pub fn new(node: Node) -> Self {
        let infected = Infected::with_node(&node);
        Self {
            node,
            infected,
            metadata: Metadata::default(),
            is_update: false,
        }
    }

    /// A heartbeat announcing freshly published metadata.
    pub fn update(node: Node, metadata: Metadata) -> Self {
        Self {
            metadata,
            is_update: true,
            ..Self::new(node)
        }
    }
}

/// Anti-entropy swap payload: who is asking and what version they hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    /// Sender of the swap packet.
    pub node: Node,
    /// Sender's current metadata.
    pub metadata: Metadata,
}

/// Protocol messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Heartbeat as originally emitted.
    Heartbeat(Heartbeat),

    /// Heartbeat handed on by the diffusion engine.
    Forward {
        /// The heartbeat being spread.
        heartbeat: Heartbeat,
        /// Fast-path batch the kernel should replicate this frame to.
        mapkey: Option<NonZeroU16>,
    },

    /// Ask a peer to compare metadata versions.
    SwapRequest(Swap),

    /// Answer to a swap request, carrying newer metadata.
    SwapResponse(Swap),
}

impl Message {
    /// The wire `Type` tag.
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::Heartbeat(_) => TYPE_HEARTBEAT,
            Message::Forward { .. } => TYPE_FORWARD,
            Message::SwapRequest(_) => TYPE_SWAP_REQUEST,
            Message::SwapResponse(_) => TYPE_SWAP_RESPONSE,
        }
    }

    /// The node that sent (or originated) this message.
    pub fn sender(&self) -> &Node {
        match self {
            Message::Heartbeat(hb) | Message::Forward { heartbeat: hb, .. } => &hb.node,
            Message::SwapRequest(swap) | Message::SwapResponse(swap) => &swap.node,
        }
    }
}

/// A message plus the cluster secret it was sent under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Hashed cluster secret.
    pub secret_key: String,
    /// The message itself.
    pub message: Message,
}

impl Packet {
    /// Wrap a message.
    pub fn new(secret_key: impl Into<String>, message: Message) -> Self {
        Self {
            secret_key: secret_key.into(),
            message,
        }
    }

    /// Serialize packet to bytes.
    pub fn to_bytes(&self) -> GossipResult<Vec<u8>> {
        serde_json::to_vec(&WirePacket::from(self)).map_err(GossipError::Serialization)
    }

    /// Deserialize packet from bytes.
    pub fn from_bytes(bytes: &[u8]) -> GossipResult<Self> {
        let wire: WirePacket = serde_json::from_slice(bytes)?;
        Packet::try_from(wire)
    }
}

/// Flat wire layout of a packet.
///
/// Field order is part of the protocol (see the module docs).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct WirePacket {
    /// Message tag.
    #[serde(rename = "Type")]
    pub kind: u8,
    /// Replica counter rewritten by the kernel program.
    pub count: u16,
    /// Fast-path batch key, `0` when unused.
    pub mapkey: u16,
    /// Metadata carried by the packet.
    pub metadata: Metadata,
    /// Sender.
    pub node: Node,
    /// Peers already notified in this wave.
    #[serde(deserialize_with = "null_as_default")]
    pub infected: Infected,
    /// Whether `metadata` is a fresh publication.
    pub is_update: bool,
    /// Hashed cluster secret.
    pub secret_key: String,
}

impl From<&Packet> for WirePacket {
    fn from(packet: &Packet) -> Self {
        let mut wire = WirePacket {
            kind: packet.message.type_tag(),
            secret_key: packet.secret_key.clone(),
            ..WirePacket::default()
        };
        match &packet.message {
            Message::Heartbeat(hb) => wire.fill_heartbeat(hb),
            Message::Forward { heartbeat, mapkey } => {
                wire.fill_heartbeat(heartbeat);
                wire.mapkey = mapkey.map(NonZeroU16::get).unwrap_or(0);
            }
            Message::SwapRequest(swap) | Message::SwapResponse(swap) => {
                wire.node = swap.node.clone();
                wire.metadata = swap.metadata.clone();
            }
        }
        wire
    }
}

impl WirePacket {
    fn fill_heartbeat(&mut self, hb: &Heartbeat) {
        self.node = hb.node.clone();
        self.infected = hb.infected.clone();
        self.metadata = hb.metadata.clone();
        self.is_update = hb.is_update;
    }

    fn into_heartbeat(self) -> Heartbeat {
        Heartbeat {
            node: self.node,
            infected: self.infected,
            metadata: self.metadata,
            is_update: self.is_update,
        }
    }
}

impl TryFrom<WirePacket> for Packet {
    type Error = GossipError;

    fn try_from(wire: WirePacket) -> Result<Self, Self::Error> {
        let secret_key = wire.secret_key.clone();
        let message = match wire.kind {
            TYPE_HEARTBEAT => Message::Heartbeat(wire.into_heartbeat()),
            TYPE_FORWARD => {
                let mapkey = NonZeroU16::new(wire.mapkey);
                Message::Forward {
                    heartbeat: wire.into_heartbeat(),
                    mapkey,
                }
            }
            TYPE_SWAP_REQUEST => Message::SwapRequest(Swap {
                node: wire.node,
                metadata: wire.metadata,
            }),
            TYPE_SWAP_RESPONSE => Message::SwapResponse(Swap {
                node: wire.node,
                metadata: wire.metadata,
            }),
            other => {
                return Err(GossipError::InvalidPacket {
                    reason: format!("unknown packet type {}", other),
                })
            }
        };
        Ok(Packet { secret_key, message })
    }
}

/// Read the batch key the way the kernel program does.
///
/// Returns `None` unless the bytes at the fixed offsets spell out a non-zero
/// three-digit key.
pub fn peek_mapkey(payload: &[u8]) -> Option<NonZeroU16> {
    if payload.len() < MAPKEY_OFFSET + 3 {
        return None;
    }
    if payload[21] != b'M' || payload[23] != b'p' || payload[26] != b'y' {
        return None;
    }
    let digits = &payload[MAPKEY_OFFSET..MAPKEY_OFFSET + 3];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let key = digits.iter().fold(0u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    NonZeroU16::new(key)
}

/// Turn a raw received frame into a packet payload.
///
/// Drops the link, network and transport headers, then resets the replica
/// counter the kernel program rewrote so the payload decodes like the original.
pub fn strip_frame(frame: &[u8]) -> GossipResult<Vec<u8>> {
    if frame.len() <= FRAME_HEADER_LEN {
        return Err(GossipError::InvalidPacket {
            reason: format!("frame of {} bytes has no payload", frame.len()),
        });
    }
    let mut payload = frame[FRAME_HEADER_LEN..].to_vec();
    if payload.len() > COUNT_OFFSET {
        payload[COUNT_OFFSET] = b'0';
    }
    Ok(payload)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
