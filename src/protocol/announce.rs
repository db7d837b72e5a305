//! Identity announcement wire format
//!
//! Wire layout: `flags(1) ‖ peerID(8) ‖ len(2)+staticPubKey ‖
//! len(2)+signingPubKey ‖ len(2)+nickname ‖ timestamp(8 BE) ‖
//! [previousPeerID(8) if flags.b0] ‖ len(2)+signature`.
//!
//! The Ed25519 signature covers `utf8(peerID) ‖ staticPubKey ‖
//! utf8(decimalMillis(timestamp))`, using the decimal rendering of the
//! millisecond timestamp, byte-exact with the iOS peer.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use super::{peer_id_to_hex, PeerId, PEER_ID_SIZE};
use crate::error::{Error, Result};

const ANNOUNCE_FLAG_HAS_PREVIOUS_PEER_ID: u8 = 0x01;

/// A signed binding of an ephemeral peer ID to a stable identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoiseIdentityAnnouncement {
    pub peer_id: PeerId,
    /// Noise static public key; its SHA-256 is the peer fingerprint
    pub static_public_key: Vec<u8>,
    /// Ed25519 public key the signature verifies under
    pub signing_public_key: Vec<u8>,
    pub nickname: String,
    /// Milliseconds since epoch
    pub timestamp: u64,
    /// Set on peer-ID rotation so neighbors can rebind session state
    pub previous_peer_id: Option<PeerId>,
    pub signature: Vec<u8>,
}

impl NoiseIdentityAnnouncement {
    /// The exact byte string the Ed25519 signature covers
    pub fn signing_payload(peer_id: &PeerId, static_public_key: &[u8], timestamp: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(16 + static_public_key.len() + 13);
        payload.extend_from_slice(peer_id_to_hex(peer_id).as_bytes());
        payload.extend_from_slice(static_public_key);
        payload.extend_from_slice(timestamp.to_string().as_bytes());
        payload
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(
            1 + PEER_ID_SIZE * 2
                + self.static_public_key.len()
                + self.signing_public_key.len()
                + self.nickname.len()
                + self.signature.len()
                + 16,
        );

        let mut flags = 0u8;
        if self.previous_peer_id.is_some() {
            flags |= ANNOUNCE_FLAG_HAS_PREVIOUS_PEER_ID;
        }
        buffer
            .write_u8(flags)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer.extend_from_slice(&self.peer_id);

        write_field(&mut buffer, &self.static_public_key)?;
        write_field(&mut buffer, &self.signing_public_key)?;
        write_field(&mut buffer, self.nickname.as_bytes())?;

        buffer
            .write_u64::<BigEndian>(self.timestamp)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        if let Some(previous) = &self.previous_peer_id {
            buffer.extend_from_slice(previous);
        }

        write_field(&mut buffer, &self.signature)?;

        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let flags = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let mut peer_id = [0u8; PEER_ID_SIZE];
        cursor
            .read_exact(&mut peer_id)
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let static_public_key = read_field(&mut cursor)?;
        let signing_public_key = read_field(&mut cursor)?;
        let nickname = String::from_utf8(read_field(&mut cursor)?)
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let timestamp = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let previous_peer_id = if flags & ANNOUNCE_FLAG_HAS_PREVIOUS_PEER_ID != 0 {
            let mut previous = [0u8; PEER_ID_SIZE];
            cursor
                .read_exact(&mut previous)
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            Some(previous)
        } else {
            None
        };

        let signature = read_field(&mut cursor)?;

        if cursor.position() as usize != data.len() {
            return Err(Error::Deserialization(
                "trailing bytes after identity announcement".to_string(),
            ));
        }

        Ok(Self {
            peer_id,
            static_public_key,
            signing_public_key,
            nickname,
            timestamp,
            previous_peer_id,
            signature,
        })
    }
}

fn write_field(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u16::MAX as usize {
        return Err(Error::Serialization(format!(
            "field too long: {} bytes",
            bytes.len()
        )));
    }
    buffer
        .write_u16::<BigEndian>(bytes.len() as u16)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    buffer.extend_from_slice(bytes);
    Ok(())
}

fn read_field(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|e| Error::Deserialization(e.to_string()))? as usize;
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_announcement() -> NoiseIdentityAnnouncement {
        NoiseIdentityAnnouncement {
            peer_id: [0x0A; 8],
            static_public_key: vec![0x11; 32],
            signing_public_key: vec![0x22; 32],
            nickname: "alice".to_string(),
            timestamp: 1_700_000_000_123,
            previous_peer_id: None,
            signature: vec![0x33; 64],
        }
    }

    #[test]
    fn test_roundtrip() {
        let announcement = sample_announcement();
        let decoded =
            NoiseIdentityAnnouncement::decode(&announcement.encode().unwrap()).unwrap();
        assert_eq!(announcement, decoded);
    }

    #[test]
    fn test_roundtrip_with_rotation() {
        let mut announcement = sample_announcement();
        announcement.previous_peer_id = Some([0x0B; 8]);
        let decoded =
            NoiseIdentityAnnouncement::decode(&announcement.encode().unwrap()).unwrap();
        assert_eq!(decoded.previous_peer_id, Some([0x0B; 8]));
    }

    #[test]
    fn test_signing_payload_uses_decimal_millis() {
        let peer_id = [0x0A; 8];
        let static_key = vec![0x11; 32];
        let payload =
            NoiseIdentityAnnouncement::signing_payload(&peer_id, &static_key, 1_700_000_000_123);

        let mut expected = b"0a0a0a0a0a0a0a0a".to_vec();
        expected.extend_from_slice(&static_key);
        expected.extend_from_slice(b"1700000000123");
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_rejects_truncated() {
        let encoded = sample_announcement().encode().unwrap();
        assert!(NoiseIdentityAnnouncement::decode(&encoded[..encoded.len() - 2]).is_err());
    }
}
