//! Chat message payload sub-format
//!
//! A `MESSAGE` packet's payload is a self-describing binary record with a
//! flags byte for the optional fields. Strings are UTF-8 with a 2-byte
//! big-endian length prefix; lists are a 1-byte count of length-prefixed
//! items. Field order is fixed and pinned by round-trip tests.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

// Flag bit positions for optional fields
pub const MSG_FLAG_IS_RELAY: u8 = 0x01;
pub const MSG_FLAG_IS_PRIVATE: u8 = 0x02;
pub const MSG_FLAG_IS_ENCRYPTED: u8 = 0x04;
pub const MSG_FLAG_HAS_CHANNEL: u8 = 0x08;
pub const MSG_FLAG_HAS_MENTIONS: u8 = 0x10;
pub const MSG_FLAG_HAS_RECIPIENT_NICKNAME: u8 = 0x20;
pub const MSG_FLAG_HAS_SENDER_PEER_ID: u8 = 0x40;

/// A chat message as carried inside a `MESSAGE` packet payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitchatMessage {
    /// Message identifier, unique per sender
    pub id: String,
    /// Sender nickname at send time
    pub sender: String,
    /// Plaintext content; empty when `encrypted_content` carries the body
    pub content: String,
    /// Milliseconds since epoch; receivers replace this with local time
    pub timestamp: u64,
    pub is_relay: bool,
    /// Nickname of the original sender when relayed by a third party
    pub original_sender: Option<String>,
    pub is_private: bool,
    pub recipient_nickname: Option<String>,
    /// Origin peer ID in its 16-hex-char rendering
    pub sender_peer_id: Option<String>,
    pub mentions: Option<Vec<String>>,
    pub channel: Option<String>,
    /// Channel ciphertext when the channel is password protected
    pub encrypted_content: Option<Vec<u8>>,
}

impl BitchatMessage {
    pub fn new(id: String, sender: String, content: String, timestamp: u64) -> Self {
        Self {
            id,
            sender,
            content,
            timestamp,
            is_relay: false,
            original_sender: None,
            is_private: false,
            recipient_nickname: None,
            sender_peer_id: None,
            mentions: None,
            channel: None,
            encrypted_content: None,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.is_relay {
            flags |= MSG_FLAG_IS_RELAY;
        }
        if self.is_private {
            flags |= MSG_FLAG_IS_PRIVATE;
        }
        if self.encrypted_content.is_some() {
            flags |= MSG_FLAG_IS_ENCRYPTED;
        }
        if self.channel.is_some() {
            flags |= MSG_FLAG_HAS_CHANNEL;
        }
        if self.mentions.is_some() {
            flags |= MSG_FLAG_HAS_MENTIONS;
        }
        if self.recipient_nickname.is_some() {
            flags |= MSG_FLAG_HAS_RECIPIENT_NICKNAME;
        }
        if self.sender_peer_id.is_some() {
            flags |= MSG_FLAG_HAS_SENDER_PEER_ID;
        }
        flags
    }

    /// Encode to the wire sub-format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(64 + self.content.len());

        buffer
            .write_u8(self.flags())
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buffer
            .write_u64::<BigEndian>(self.timestamp)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        write_string(&mut buffer, &self.id)?;
        write_string(&mut buffer, &self.sender)?;

        if let Some(ciphertext) = &self.encrypted_content {
            write_bytes(&mut buffer, ciphertext)?;
        } else {
            write_string(&mut buffer, &self.content)?;
        }

        if self.is_relay {
            let original = self.original_sender.as_deref().unwrap_or("");
            write_string(&mut buffer, original)?;
        }
        if let Some(recipient) = &self.recipient_nickname {
            write_string(&mut buffer, recipient)?;
        }
        if let Some(peer_id) = &self.sender_peer_id {
            write_string(&mut buffer, peer_id)?;
        }
        if let Some(mentions) = &self.mentions {
            if mentions.len() > u8::MAX as usize {
                return Err(Error::Serialization("too many mentions".to_string()));
            }
            buffer
                .write_u8(mentions.len() as u8)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            for mention in mentions {
                write_string(&mut buffer, mention)?;
            }
        }
        if let Some(channel) = &self.channel {
            write_string(&mut buffer, channel)?;
        }

        Ok(buffer)
    }

    /// Decode from the wire sub-format
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let flags = cursor
            .read_u8()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        let timestamp = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;

        let id = read_string(&mut cursor)?;
        let sender = read_string(&mut cursor)?;

        let (content, encrypted_content) = if flags & MSG_FLAG_IS_ENCRYPTED != 0 {
            (String::new(), Some(read_bytes(&mut cursor)?))
        } else {
            (read_string(&mut cursor)?, None)
        };

        let original_sender = if flags & MSG_FLAG_IS_RELAY != 0 {
            Some(read_string(&mut cursor)?)
        } else {
            None
        };
        let recipient_nickname = if flags & MSG_FLAG_HAS_RECIPIENT_NICKNAME != 0 {
            Some(read_string(&mut cursor)?)
        } else {
            None
        };
        let sender_peer_id = if flags & MSG_FLAG_HAS_SENDER_PEER_ID != 0 {
            Some(read_string(&mut cursor)?)
        } else {
            None
        };
        let mentions = if flags & MSG_FLAG_HAS_MENTIONS != 0 {
            let count = cursor
                .read_u8()
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                list.push(read_string(&mut cursor)?);
            }
            Some(list)
        } else {
            None
        };
        let channel = if flags & MSG_FLAG_HAS_CHANNEL != 0 {
            Some(read_string(&mut cursor)?)
        } else {
            None
        };

        if cursor.position() as usize != data.len() {
            return Err(Error::Deserialization(
                "trailing bytes after message fields".to_string(),
            ));
        }

        Ok(Self {
            id,
            sender,
            content,
            timestamp,
            is_relay: flags & MSG_FLAG_IS_RELAY != 0,
            original_sender,
            is_private: flags & MSG_FLAG_IS_PRIVATE != 0,
            recipient_nickname,
            sender_peer_id,
            mentions,
            channel,
            encrypted_content,
        })
    }
}

fn write_string(buffer: &mut Vec<u8>, s: &str) -> Result<()> {
    write_bytes(buffer, s.as_bytes())
}

fn write_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
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

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let bytes = read_bytes(cursor)?;
    String::from_utf8(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor
        .read_u16::<BigEndian>()
        .map_err(|e| Error::Deserialization(e.to_string()))? as usize;
    let mut bytes = vec![0u8; len];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(bytes)
}

/// Acknowledgement that a private message reached its recipient. Travels
/// type-tagged inside a NOISE_ENCRYPTED envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    /// ID of the message being acknowledged
    pub message_id: String,
    /// Nickname of the acknowledging recipient
    pub recipient_nickname: String,
    pub timestamp: u64,
}

impl DeliveryAck {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(16 + self.message_id.len());
        write_string(&mut buffer, &self.message_id)?;
        write_string(&mut buffer, &self.recipient_nickname)?;
        buffer
            .write_u64::<BigEndian>(self.timestamp)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let message_id = read_string(&mut cursor)?;
        let recipient_nickname = read_string(&mut cursor)?;
        let timestamp = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        if cursor.position() as usize != data.len() {
            return Err(Error::Deserialization("trailing bytes after ack".to_string()));
        }
        Ok(Self {
            message_id,
            recipient_nickname,
            timestamp,
        })
    }
}

/// Read receipt for a private message. Same transport as [`DeliveryAck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: String,
    pub reader_nickname: String,
    pub timestamp: u64,
}

impl ReadReceipt {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(16 + self.message_id.len());
        write_string(&mut buffer, &self.message_id)?;
        write_string(&mut buffer, &self.reader_nickname)?;
        buffer
            .write_u64::<BigEndian>(self.timestamp)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let message_id = read_string(&mut cursor)?;
        let reader_nickname = read_string(&mut cursor)?;
        let timestamp = cursor
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        if cursor.position() as usize != data.len() {
            return Err(Error::Deserialization(
                "trailing bytes after receipt".to_string(),
            ));
        }
        Ok(Self {
            message_id,
            reader_nickname,
            timestamp,
        })
    }
}

/// Sent when encryption fails for lack of a session: asks the recipient to
/// complete a handshake so queued messages can flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub requester_nickname: String,
    /// Messages waiting in the requester's store-and-forward cache
    pub pending_count: u16,
}

impl HandshakeRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(4 + self.requester_nickname.len());
        write_string(&mut buffer, &self.requester_nickname)?;
        buffer
            .write_u16::<BigEndian>(self.pending_count)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let requester_nickname = read_string(&mut cursor)?;
        let pending_count = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Deserialization(e.to_string()))?;
        if cursor.position() as usize != data.len() {
            return Err(Error::Deserialization(
                "trailing bytes after handshake request".to_string(),
            ));
        }
        Ok(Self {
            requester_nickname,
            pending_count,
        })
    }
}
