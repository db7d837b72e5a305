//! Bit-exact binary codec for mesh packets
//!
//! Wire layout: `version(1) ‖ type(1) ‖ ttl(1) ‖ timestamp(8 BE) ‖ flags(1)
//! ‖ senderID(8) ‖ [recipientID(8) if flags.b0] ‖ payload-length(2 BE) ‖
//! payload ‖ [signature(64) if flags.b1]`. Shared byte-for-byte with the
//! iOS peer.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use super::{
    BitchatPacket, FLAG_MASK, FLAG_RECIPIENT_PRESENT, FLAG_SIGNATURE_PRESENT, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, MIN_PACKET_SIZE, PEER_ID_SIZE, PROTOCOL_VERSION, SIGNATURE_SIZE,
};
use crate::error::{Error, Result};

pub struct BinaryProtocol;

impl BinaryProtocol {
    /// Encode a packet to its wire representation
    pub fn encode(packet: &BitchatPacket) -> Result<Vec<u8>> {
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::Serialization(format!(
                "payload too large: {} bytes",
                packet.payload.len()
            )));
        }

        let mut buffer = Vec::with_capacity(
            MIN_PACKET_SIZE + PEER_ID_SIZE + packet.payload.len() + SIGNATURE_SIZE,
        );

        buffer
            .write_u8(packet.version)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer
            .write_u8(packet.packet_type)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer
            .write_u8(packet.ttl)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer
            .write_u64::<BigEndian>(packet.timestamp)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer
            .write_u8(packet.flags())
            .map_err(|e| Error::Serialization(e.to_string()))?;

        buffer.extend_from_slice(&packet.sender_id);

        if let Some(recipient) = &packet.recipient_id {
            buffer.extend_from_slice(recipient);
        }

        buffer
            .write_u16::<BigEndian>(packet.payload.len() as u16)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer.extend_from_slice(&packet.payload);

        if let Some(signature) = &packet.signature {
            buffer.extend_from_slice(signature);
        }

        Ok(buffer)
    }

    /// Decode wire bytes into a packet.
    ///
    /// Rejects unknown versions, unknown flag bits, length mismatches and
    /// truncated buffers.
    pub fn decode(data: &[u8]) -> Result<BitchatPacket> {
        if data.len() < MIN_PACKET_SIZE {
            return Err(Error::Deserialization(format!(
                "packet too small: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        if version != PROTOCOL_VERSION {
            return Err(Error::Deserialization(format!(
                "unknown protocol version {}",
                version
            )));
        }

        let packet_type = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let ttl = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let timestamp = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let flags = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        if flags & !FLAG_MASK != 0 {
            return Err(Error::Deserialization(format!(
                "unknown flag bits 0x{:02x}",
                flags & !FLAG_MASK
            )));
        }

        let mut sender_id = [0u8; PEER_ID_SIZE];
        cursor
            .read_exact(&mut sender_id)
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let recipient_id = if flags & FLAG_RECIPIENT_PRESENT != 0 {
            let mut recipient = [0u8; PEER_ID_SIZE];
            cursor
                .read_exact(&mut recipient)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            Some(recipient)
        } else {
            None
        };

        let payload_length = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))? as usize;

        // Exact-length discipline: the buffer must hold precisely the
        // declared payload plus the signature the flags promise.
        let consumed = cursor.position() as usize;
        let expected_trailer =
            payload_length + if flags & FLAG_SIGNATURE_PRESENT != 0 { SIGNATURE_SIZE } else { 0 };
        let remaining = data.len() - consumed;
        if remaining != expected_trailer {
            return Err(Error::Deserialization(format!(
                "length mismatch: header declares {} trailing bytes, buffer holds {}",
                expected_trailer, remaining
            )));
        }

        let mut payload = vec![0u8; payload_length];
        cursor
            .read_exact(&mut payload)
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let signature = if flags & FLAG_SIGNATURE_PRESENT != 0 {
            let mut sig = [0u8; SIGNATURE_SIZE];
            cursor
                .read_exact(&mut sig)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            Some(sig)
        } else {
            None
        };

        Ok(BitchatPacket {
            version,
            packet_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }
}
