//! Wire protocol for the BitChat mesh
//!
//! This module implements the binary protocol shared byte-for-byte with the
//! iOS peer:
//! - Fixed 12-byte header with optional recipient and signature fields
//! - TTL-bounded flood routing metadata
//! - Fragmentation for payloads exceeding the BLE link budget
//! - Chat message and identity announcement sub-formats

pub mod announce;
pub mod binary;
pub mod fragment;
pub mod message;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Protocol version spoken on the wire. Receivers drop anything else.
pub const PROTOCOL_VERSION: u8 = 1;

// Message type tags, stable on the wire. Unknown values are reserved and
// dropped by decoders.
pub const MESSAGE_TYPE_ANNOUNCE: u8 = 0x01;
pub const MESSAGE_TYPE_LEAVE: u8 = 0x03;
pub const MESSAGE_TYPE_MESSAGE: u8 = 0x04;
pub const MESSAGE_TYPE_FRAGMENT_START: u8 = 0x05;
pub const MESSAGE_TYPE_FRAGMENT_CONTINUE: u8 = 0x06;
pub const MESSAGE_TYPE_FRAGMENT_END: u8 = 0x07;
pub const MESSAGE_TYPE_DELIVERY_ACK: u8 = 0x0A;
pub const MESSAGE_TYPE_READ_RECEIPT: u8 = 0x0B;
pub const MESSAGE_TYPE_NOISE_HANDSHAKE_INIT: u8 = 0x10;
pub const MESSAGE_TYPE_NOISE_HANDSHAKE_RESP: u8 = 0x11;
pub const MESSAGE_TYPE_NOISE_ENCRYPTED: u8 = 0x12;
pub const MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE: u8 = 0x13;
pub const MESSAGE_TYPE_HANDSHAKE_REQUEST: u8 = 0x14;

// Flag bit positions
pub const FLAG_RECIPIENT_PRESENT: u8 = 0x01; // Bit 0
pub const FLAG_SIGNATURE_PRESENT: u8 = 0x02; // Bit 1
/// All defined flag bits; decoders reject packets with any other bit set.
pub const FLAG_MASK: u8 = FLAG_RECIPIENT_PRESENT | FLAG_SIGNATURE_PRESENT;

// TTL budgets per message class
pub const MAX_TTL: u8 = 7;
pub const ANNOUNCE_TTL: u8 = 3;
pub const DIRECT_TTL: u8 = 1;

/// Fixed header size: version(1) + type(1) + ttl(1) + timestamp(8) + flags(1)
pub const HEADER_SIZE: usize = 12;

/// Smallest well-formed packet: header + sender + payload length field
pub const MIN_PACKET_SIZE: usize = HEADER_SIZE + PEER_ID_SIZE + 2;

pub const PEER_ID_SIZE: usize = 8;
pub const SIGNATURE_SIZE: usize = 64;
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Peer identifier - 8 bytes, rendered as 16 lowercase hex characters
pub type PeerId = [u8; 8];

/// The all-0xFF recipient denotes broadcast, as does an absent recipient
pub const BROADCAST_RECIPIENT: PeerId = [0xFF; PEER_ID_SIZE];

/// TTL a freshly created packet of the given type starts with
pub fn initial_ttl(packet_type: u8) -> u8 {
    match packet_type {
        MESSAGE_TYPE_ANNOUNCE | MESSAGE_TYPE_LEAVE | MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE => {
            ANNOUNCE_TTL
        }
        _ => MAX_TTL,
    }
}

/// Generate a fresh ephemeral peer ID from the system CSPRNG
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; PEER_ID_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

/// Render a peer ID in its canonical wire/log form
pub fn peer_id_to_hex(peer_id: &PeerId) -> String {
    hex::encode(peer_id)
}

/// Parse a 16-hex-char peer ID
pub fn peer_id_from_hex(s: &str) -> Option<PeerId> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The unit of the mesh protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatPacket {
    pub version: u8,
    pub packet_type: u8,
    pub ttl: u8,
    /// Milliseconds since epoch, used for replay rejection
    pub timestamp: u64,
    /// Origin peer, not the relayer
    pub sender_id: PeerId,
    /// `None` means broadcast
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    /// Ed25519 signature over header and payload, used by identity
    /// announcements; individual messages are authenticated via Noise
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl BitchatPacket {
    /// Create a broadcast packet with the given TTL budget
    pub fn new_broadcast(packet_type: u8, sender_id: PeerId, ttl: u8, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp: now_millis(),
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Create a packet addressed to a single peer
    pub fn new_direct(
        packet_type: u8,
        sender_id: PeerId,
        recipient_id: PeerId,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp: now_millis(),
            sender_id,
            recipient_id: Some(recipient_id),
            payload,
            signature: None,
        }
    }

    /// Flags byte as it appears on the wire
    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.recipient_id.is_some() {
            flags |= FLAG_RECIPIENT_PRESENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_SIGNATURE_PRESENT;
        }
        flags
    }

    /// True when the recipient field is absent or the broadcast sentinel
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(recipient) => recipient == BROADCAST_RECIPIENT,
        }
    }

    /// True when addressed specifically to `peer_id`
    pub fn is_addressed_to(&self, peer_id: &PeerId) -> bool {
        self.recipient_id.as_ref() == Some(peer_id) && !self.is_broadcast()
    }
}

/// In-memory envelope for a packet in flight through this node.
///
/// The immediate sender may differ from `packet.sender_id` when the packet
/// was relayed; both are needed to suppress echo-back relays.
#[derive(Debug, Clone)]
pub struct RoutedPacket {
    pub packet: BitchatPacket,
    /// Direct neighbor the packet was received from, if inbound
    pub relay_peer: Option<PeerId>,
    /// Link-layer device address the packet arrived on, if inbound
    pub relay_address: Option<String>,
}

impl RoutedPacket {
    /// Wrap a locally originated packet
    pub fn local(packet: BitchatPacket) -> Self {
        Self {
            packet,
            relay_peer: None,
            relay_address: None,
        }
    }

    /// Wrap a packet received from a direct neighbor
    pub fn inbound(packet: BitchatPacket, relay_peer: PeerId, relay_address: String) -> Self {
        Self {
            packet,
            relay_peer: Some(relay_peer),
            relay_address: Some(relay_address),
        }
    }
}
