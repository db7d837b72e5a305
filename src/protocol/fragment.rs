//! Fragmentation and reassembly for oversized packets
//!
//! Any packet whose encoded form exceeds [`MAX_FRAGMENT_SIZE`] is split
//! into FRAGMENT_START / FRAGMENT_CONTINUE / FRAGMENT_END packets carrying
//! `fragmentID(8) ‖ index(2 BE) ‖ total(2 BE) ‖ originalType(1) ‖ chunk`.
//! The 150-byte threshold is required for cross-compatibility with the
//! iOS peer and must not change.
//!
//! Fragment IDs are opaque random values; collisions are mitigated by the
//! 30 s assembly expiry rather than prevented.

use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::binary::BinaryProtocol;
use super::{
    BitchatPacket, MESSAGE_TYPE_FRAGMENT_CONTINUE, MESSAGE_TYPE_FRAGMENT_END,
    MESSAGE_TYPE_FRAGMENT_START,
};
use crate::error::{Error, Result};

/// Encoded packets above this many bytes are fragmented (iOS cross-compat)
pub const MAX_FRAGMENT_SIZE: usize = 150;

/// `fragmentID(8) + index(2) + total(2) + originalType(1)`
pub const FRAGMENT_HEADER_SIZE: usize = 13;

/// Incomplete assemblies are dropped this long after their first fragment
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

type FragmentId = [u8; 8];

/// One in-progress reassembly
struct FragmentAssembly {
    original_type: u8,
    total_fragments: u16,
    received: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

/// Splits oversized packets and reassembles inbound fragments
pub struct FragmentManager {
    assemblies: Mutex<HashMap<FragmentId, FragmentAssembly>>,
    timeout: Duration,
}

impl Default for FragmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentManager {
    pub fn new() -> Self {
        Self::with_timeout(FRAGMENT_TIMEOUT)
    }

    /// Timeout override for tests
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            assemblies: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// True when `packet` must be fragmented before transmission
    pub fn needs_fragmentation(packet: &BitchatPacket) -> Result<bool> {
        Ok(BinaryProtocol::encode(packet)?.len() > MAX_FRAGMENT_SIZE)
    }

    /// Split a packet into fragment packets.
    ///
    /// Returns the original packet unchanged when it fits in one frame.
    /// Fragment packets inherit the original's sender, recipient and TTL so
    /// each fragment floods independently.
    pub fn create_fragments(packet: &BitchatPacket) -> Result<Vec<BitchatPacket>> {
        let encoded = BinaryProtocol::encode(packet)?;
        if encoded.len() <= MAX_FRAGMENT_SIZE {
            return Ok(vec![packet.clone()]);
        }

        let chunk_size = MAX_FRAGMENT_SIZE - FRAGMENT_HEADER_SIZE;
        let total = encoded.len().div_ceil(chunk_size);
        if total > u16::MAX as usize {
            return Err(Error::Serialization(format!(
                "packet needs {} fragments, limit is {}",
                total,
                u16::MAX
            )));
        }

        let mut fragment_id = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut fragment_id);

        let mut fragments = Vec::with_capacity(total);
        for (index, chunk) in encoded.chunks(chunk_size).enumerate() {
            let fragment_type = if index == 0 {
                MESSAGE_TYPE_FRAGMENT_START
            } else if index == total - 1 {
                MESSAGE_TYPE_FRAGMENT_END
            } else {
                MESSAGE_TYPE_FRAGMENT_CONTINUE
            };

            let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
            payload.extend_from_slice(&fragment_id);
            let mut index_bytes = [0u8; 2];
            BigEndian::write_u16(&mut index_bytes, index as u16);
            payload.extend_from_slice(&index_bytes);
            let mut total_bytes = [0u8; 2];
            BigEndian::write_u16(&mut total_bytes, total as u16);
            payload.extend_from_slice(&total_bytes);
            payload.push(packet.packet_type);
            payload.extend_from_slice(chunk);

            fragments.push(BitchatPacket {
                version: packet.version,
                packet_type: fragment_type,
                ttl: packet.ttl,
                timestamp: packet.timestamp,
                sender_id: packet.sender_id,
                recipient_id: packet.recipient_id,
                payload,
                signature: None,
            });
        }

        Ok(fragments)
    }

    /// Feed one inbound fragment; returns the reassembled inner packet once
    /// all pieces have arrived. Expired assemblies are collected on every
    /// call, so a late fragment cannot resurrect a dropped one.
    pub async fn handle_fragment(&self, packet: &BitchatPacket) -> Option<BitchatPacket> {
        let (fragment_id, index, total, original_type, chunk) =
            Self::parse_fragment_payload(&packet.payload)?;

        let mut assemblies = self.assemblies.lock().await;

        let now = Instant::now();
        assemblies.retain(|_, assembly| now.duration_since(assembly.first_seen) < self.timeout);

        let assembly = assemblies
            .entry(fragment_id)
            .or_insert_with(|| FragmentAssembly {
                original_type,
                total_fragments: total,
                received: HashMap::new(),
                first_seen: now,
            });

        if assembly.total_fragments != total || assembly.original_type != original_type {
            log::debug!(
                "fragment {} metadata mismatch, dropping fragment",
                hex::encode(fragment_id)
            );
            return None;
        }

        assembly.received.insert(index, chunk.to_vec());

        if assembly.received.len() < assembly.total_fragments as usize {
            return None;
        }

        let assembly = assemblies.remove(&fragment_id)?;
        let mut encoded = Vec::new();
        for i in 0..assembly.total_fragments {
            encoded.extend_from_slice(assembly.received.get(&i)?);
        }

        match BinaryProtocol::decode(&encoded) {
            Ok(inner) => Some(inner),
            Err(e) => {
                log::warn!(
                    "reassembled fragment {} failed to decode: {}",
                    hex::encode(fragment_id),
                    e
                );
                None
            }
        }
    }

    fn parse_fragment_payload(payload: &[u8]) -> Option<(FragmentId, u16, u16, u8, &[u8])> {
        if payload.len() <= FRAGMENT_HEADER_SIZE {
            return None;
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let index = BigEndian::read_u16(&payload[8..10]);
        let total = BigEndian::read_u16(&payload[10..12]);
        let original_type = payload[12];
        if total == 0 || index >= total {
            return None;
        }
        Some((
            fragment_id,
            index,
            total,
            original_type,
            &payload[FRAGMENT_HEADER_SIZE..],
        ))
    }

    /// Number of in-progress assemblies (diagnostics)
    pub async fn pending_assemblies(&self) -> usize {
        self.assemblies.lock().await.len()
    }

    /// Drop all reassembly state
    pub async fn clear(&self) {
        self.assemblies.lock().await.clear();
    }
}

/// Builds a large-payload packet useful for fragmentation paths in tests
#[cfg(test)]
fn oversized_packet(payload_len: usize) -> BitchatPacket {
    use super::{MAX_TTL, MESSAGE_TYPE_MESSAGE};
    BitchatPacket::new_broadcast(
        MESSAGE_TYPE_MESSAGE,
        [0x42; 8],
        MAX_TTL,
        (0..payload_len).map(|i| (i % 251) as u8).collect(),
    )
}
