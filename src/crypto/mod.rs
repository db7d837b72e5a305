//! Cryptographic identity for the BitChat mesh
//!
//! This module provides the key material the mesh core needs:
//! - Ed25519 signing keypair for identity announcements
//! - The Noise static keypair whose SHA-256 is the peer fingerprint
//! - Flat-file persistence of both private keys, zeroized in memory and
//!   deleted on panic wipe
//!
//! The ephemeral peer ID is NOT part of the persistent identity; it is
//! regenerated on every start and may rotate at any time.

use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::protocol::announce::NoiseIdentityAnnouncement;
use crate::protocol::{generate_peer_id, now_millis, PeerId};

/// Noise protocol pattern shared with the iOS peer
pub const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

/// Default identity file name inside the data directory
pub const IDENTITY_FILE: &str = "identity.bin";

/// Ed25519 keypair for signing and verification
#[derive(Clone)]
pub struct BitchatKeypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl BitchatKeypair {
    /// Generate a new keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from existing secret key bytes
    pub fn from_secret_key(secret_key: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret_key);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign data, returning the 64-byte signature
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key
pub fn verify_ed25519(signature: &[u8], message: &[u8], public_key: &[u8]) -> bool {
    let key_bytes: [u8; 32] = match public_key.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&key_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// SHA-256 hex fingerprint of a Noise static public key.
///
/// Stable across peer-ID rotations; the canonical identity for favorites,
/// blocks and trust decisions.
pub fn fingerprint(noise_static_public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(noise_static_public_key);
    hex::encode(hasher.finalize())
}

/// The node's full identity: ephemeral peer ID plus persistent key material
pub struct BitchatIdentity {
    /// Current ephemeral peer ID; rotates without changing the fingerprint
    pub peer_id: PeerId,
    /// Noise static keypair (x25519)
    noise_static_private: Zeroizing<[u8; 32]>,
    noise_static_public: [u8; 32],
    /// Ed25519 signing keypair for identity announcements
    pub signing_keypair: BitchatKeypair,
    /// Where the private keys persist, if anywhere
    identity_path: Option<PathBuf>,
}

impl BitchatIdentity {
    /// Generate a fresh in-memory identity (no persistence)
    pub fn generate() -> Result<Self> {
        let builder = snow::Builder::new(
            NOISE_PATTERN
                .parse()
                .map_err(|e| Error::Crypto(format!("bad noise pattern: {:?}", e)))?,
        );
        let keypair = builder.generate_keypair()?;

        let mut private = Zeroizing::new([0u8; 32]);
        private.copy_from_slice(&keypair.private);
        let mut public = [0u8; 32];
        public.copy_from_slice(&keypair.public);

        Ok(Self {
            peer_id: generate_peer_id(),
            noise_static_private: private,
            noise_static_public: public,
            signing_keypair: BitchatKeypair::generate(),
            identity_path: None,
        })
    }

    /// Load persistent key material from `dir`, generating and saving a
    /// fresh identity when none exists. The peer ID is always regenerated.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let path = dir.join(IDENTITY_FILE);
        if path.exists() {
            let bytes = Zeroizing::new(std::fs::read(&path)?);
            if bytes.len() != 64 {
                return Err(Error::Crypto(format!(
                    "corrupt identity file: {} bytes",
                    bytes.len()
                )));
            }
            let mut noise_private = Zeroizing::new([0u8; 32]);
            noise_private.copy_from_slice(&bytes[..32]);
            let mut signing_secret = Zeroizing::new([0u8; 32]);
            signing_secret.copy_from_slice(&bytes[32..]);

            let noise_public = x25519_public_key(&noise_private)?;
            let signing_keypair = BitchatKeypair::from_secret_key(&signing_secret);

            log::info!(
                "loaded persistent identity, fingerprint {}",
                &fingerprint(&noise_public)[..16]
            );

            Ok(Self {
                peer_id: generate_peer_id(),
                noise_static_private: noise_private,
                noise_static_public: noise_public,
                signing_keypair,
                identity_path: Some(path),
            })
        } else {
            let mut identity = Self::generate()?;
            std::fs::create_dir_all(dir)?;
            let mut bytes = Zeroizing::new(Vec::with_capacity(64));
            bytes.extend_from_slice(identity.noise_static_private.as_ref());
            bytes.extend_from_slice(&identity.signing_keypair.secret_key_bytes());
            std::fs::write(&path, bytes.as_slice())?;
            identity.identity_path = Some(path);
            log::info!(
                "generated new persistent identity, fingerprint {}",
                &identity.fingerprint()[..16]
            );
            Ok(identity)
        }
    }

    pub fn noise_static_private_key(&self) -> &[u8; 32] {
        &self.noise_static_private
    }

    pub fn noise_static_public_key(&self) -> &[u8; 32] {
        &self.noise_static_public
    }

    /// This node's stable fingerprint
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.noise_static_public)
    }

    /// Rotate the ephemeral peer ID, returning the previous value so it can
    /// be announced to neighbors.
    pub fn rotate_peer_id(&mut self) -> PeerId {
        let previous = self.peer_id;
        self.peer_id = generate_peer_id();
        log::info!(
            "rotated peer id {} -> {}",
            hex::encode(previous),
            hex::encode(self.peer_id)
        );
        previous
    }

    /// Build a signed identity announcement for the current peer ID
    pub fn sign_announcement(
        &self,
        nickname: &str,
        previous_peer_id: Option<PeerId>,
    ) -> NoiseIdentityAnnouncement {
        let timestamp = now_millis();
        let payload = NoiseIdentityAnnouncement::signing_payload(
            &self.peer_id,
            &self.noise_static_public,
            timestamp,
        );
        let signature = self.signing_keypair.sign(&payload);

        NoiseIdentityAnnouncement {
            peer_id: self.peer_id,
            static_public_key: self.noise_static_public.to_vec(),
            signing_public_key: self.signing_keypair.public_key_bytes().to_vec(),
            nickname: nickname.to_string(),
            timestamp,
            previous_peer_id,
            signature: signature.to_vec(),
        }
    }

    /// Delete the on-disk key material and regenerate everything in memory.
    /// Part of panic-mode `clear_all`.
    pub fn wipe_and_regenerate(&mut self) -> Result<()> {
        if let Some(path) = &self.identity_path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        let path = self.identity_path.clone();
        *self = Self::generate()?;
        if let Some(path) = path {
            if let Some(dir) = path.parent() {
                return match Self::load_or_generate(dir) {
                    Ok(fresh) => {
                        *self = fresh;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
            }
        }
        Ok(())
    }
}

/// Verify an identity announcement's signature against its own claimed
/// signing key. The claimed key is bound to the fingerprint by the caller.
pub fn verify_announcement(announcement: &NoiseIdentityAnnouncement) -> bool {
    let payload = NoiseIdentityAnnouncement::signing_payload(
        &announcement.peer_id,
        &announcement.static_public_key,
        announcement.timestamp,
    );
    verify_ed25519(
        &announcement.signature,
        &payload,
        &announcement.signing_public_key,
    )
}

/// Derive the x25519 public key for a stored Noise static private key
fn x25519_public_key(private: &[u8; 32]) -> Result<[u8; 32]> {
    let secret = x25519_dalek::StaticSecret::from(*private);
    Ok(*x25519_dalek::PublicKey::from(&secret).as_bytes())
}
