//! snow-backed Noise XX session
//!
//! One `NoiseSession` is the cryptographic half of a session with a single
//! peer. The surrounding state machine (initiation, retry, rekey policy)
//! lives in [`super::SecurityManager`]; this type only drives snow.

use snow::{Builder, HandshakeState, TransportState};
use std::time::Instant;

use crate::crypto::NOISE_PATTERN;
use crate::error::{Error, Result};

/// Noise message buffer bound; XX messages stay far below this
const NOISE_MAX_MESSAGE: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseRole {
    Initiator,
    Responder,
}

enum NoiseState {
    Handshaking(Box<HandshakeState>),
    Transport(Box<TransportState>),
    Terminated,
}

pub struct NoiseSession {
    pub role: NoiseRole,
    state: NoiseState,
    remote_static: Option<[u8; 32]>,
    handshake_hash: Option<[u8; 32]>,
    pub established_at: Option<Instant>,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl NoiseSession {
    pub fn new_initiator(local_static_private: &[u8; 32]) -> Result<Self> {
        let handshake = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| Error::Crypto(format!("bad noise pattern: {:?}", e)))?,
        )
        .local_private_key(local_static_private)?
        .build_initiator()?;

        Ok(Self {
            role: NoiseRole::Initiator,
            state: NoiseState::Handshaking(Box::new(handshake)),
            remote_static: None,
            handshake_hash: None,
            established_at: None,
            messages_sent: 0,
            messages_received: 0,
        })
    }

    pub fn new_responder(local_static_private: &[u8; 32]) -> Result<Self> {
        let handshake = Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| Error::Crypto(format!("bad noise pattern: {:?}", e)))?,
        )
        .local_private_key(local_static_private)?
        .build_responder()?;

        Ok(Self {
            role: NoiseRole::Responder,
            state: NoiseState::Handshaking(Box::new(handshake)),
            remote_static: None,
            handshake_hash: None,
            established_at: None,
            messages_sent: 0,
            messages_received: 0,
        })
    }

    /// Produce the next outbound handshake message
    pub fn write_handshake_message(&mut self) -> Result<Vec<u8>> {
        match &mut self.state {
            NoiseState::Handshaking(handshake) => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                let len = handshake.write_message(&[], &mut buffer)?;
                buffer.truncate(len);
                self.maybe_finish_handshake()?;
                Ok(buffer)
            }
            _ => Err(Error::InvalidState("handshake already complete".to_string())),
        }
    }

    /// Consume an inbound handshake message
    pub fn read_handshake_message(&mut self, message: &[u8]) -> Result<()> {
        match &mut self.state {
            NoiseState::Handshaking(handshake) => {
                let mut buffer = vec![0u8; NOISE_MAX_MESSAGE];
                handshake.read_message(message, &mut buffer)?;
                self.maybe_finish_handshake()?;
                Ok(())
            }
            _ => Err(Error::InvalidState("handshake already complete".to_string())),
        }
    }

    fn maybe_finish_handshake(&mut self) -> Result<()> {
        let finished = matches!(&self.state, NoiseState::Handshaking(h) if h.is_handshake_finished());
        if !finished {
            return Ok(());
        }

        let old_state = std::mem::replace(&mut self.state, NoiseState::Terminated);
        if let NoiseState::Handshaking(handshake) = old_state {
            let hash_slice = handshake.get_handshake_hash();
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&hash_slice[..32]);
            self.handshake_hash = Some(hash);

            self.remote_static = handshake.get_remote_static().map(|key| {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(key);
                bytes
            });

            let transport = handshake.into_transport_mode()?;
            self.state = NoiseState::Transport(Box::new(transport));
            self.established_at = Some(Instant::now());
        }
        Ok(())
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            NoiseState::Transport(transport) => {
                let mut buffer = vec![0u8; plaintext.len() + 16];
                let len = transport.write_message(plaintext, &mut buffer)?;
                buffer.truncate(len);
                self.messages_sent += 1;
                Ok(buffer)
            }
            _ => Err(Error::InvalidState("session not established".to_string())),
        }
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match &mut self.state {
            NoiseState::Transport(transport) => {
                let mut buffer = vec![0u8; ciphertext.len()];
                let len = transport.read_message(ciphertext, &mut buffer)?;
                buffer.truncate(len);
                self.messages_received += 1;
                Ok(buffer)
            }
            _ => Err(Error::InvalidState("session not established".to_string())),
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, NoiseState::Transport(_))
    }

    /// Peer's static public key; present once the handshake completes
    pub fn remote_static_key(&self) -> Option<&[u8; 32]> {
        self.remote_static.as_ref()
    }

    pub fn handshake_hash(&self) -> Option<&[u8; 32]> {
        self.handshake_hash.as_ref()
    }

    pub fn terminate(&mut self) {
        self.state = NoiseState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BitchatIdentity;

    fn pair() -> (NoiseSession, NoiseSession) {
        let a = BitchatIdentity::generate().unwrap();
        let b = BitchatIdentity::generate().unwrap();
        (
            NoiseSession::new_initiator(a.noise_static_private_key()).unwrap(),
            NoiseSession::new_responder(b.noise_static_private_key()).unwrap(),
        )
    }

    fn complete_handshake(initiator: &mut NoiseSession, responder: &mut NoiseSession) {
        let msg1 = initiator.write_handshake_message().unwrap();
        responder.read_handshake_message(&msg1).unwrap();
        let msg2 = responder.write_handshake_message().unwrap();
        initiator.read_handshake_message(&msg2).unwrap();
        let msg3 = initiator.write_handshake_message().unwrap();
        responder.read_handshake_message(&msg3).unwrap();
    }

    #[test]
    fn test_xx_handshake_establishes_both_sides() {
        let (mut initiator, mut responder) = pair();
        complete_handshake(&mut initiator, &mut responder);
        assert!(initiator.is_established());
        assert!(responder.is_established());
        assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
    }

    #[test]
    fn test_remote_static_keys_exchanged() {
        let a = BitchatIdentity::generate().unwrap();
        let b = BitchatIdentity::generate().unwrap();
        let mut initiator = NoiseSession::new_initiator(a.noise_static_private_key()).unwrap();
        let mut responder = NoiseSession::new_responder(b.noise_static_private_key()).unwrap();
        complete_handshake(&mut initiator, &mut responder);

        assert_eq!(
            initiator.remote_static_key(),
            Some(b.noise_static_public_key())
        );
        assert_eq!(
            responder.remote_static_key(),
            Some(a.noise_static_public_key())
        );
    }

    #[test]
    fn test_transport_roundtrip() {
        let (mut initiator, mut responder) = pair();
        complete_handshake(&mut initiator, &mut responder);

        let ciphertext = initiator.encrypt(b"private hello").unwrap();
        assert_ne!(ciphertext, b"private hello");
        assert_eq!(responder.decrypt(&ciphertext).unwrap(), b"private hello");

        let reply = responder.encrypt(b"ack").unwrap();
        assert_eq!(initiator.decrypt(&reply).unwrap(), b"ack");
        assert_eq!(initiator.messages_sent, 1);
        assert_eq!(initiator.messages_received, 1);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut initiator, mut responder) = pair();
        complete_handshake(&mut initiator, &mut responder);

        let mut ciphertext = initiator.encrypt(b"payload").unwrap();
        ciphertext[0] ^= 0xFF;
        assert!(responder.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_encrypt_before_established_fails() {
        let (mut initiator, _) = pair();
        assert!(initiator.encrypt(b"too early").is_err());
    }
}
