//! Replay and duplicate suppression windows
//!
//! Two bounded sets, both owned by the security manager:
//! - packet dedup over `(senderID, timestamp, payloadHash16)`, rejecting a
//!   second delivery inside the window irrespective of relay path
//! - handshake dedup over payload prefixes, preventing re-processing of a
//!   captured and re-injected handshake message
//!
//! Both are swept against the window on every insert and can be reset
//! wholesale by the periodic maintenance pass.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::protocol::{BitchatPacket, PeerId};

/// Hard cap on tracked entries, independent of the time window
const MAX_DEDUP_ENTRIES: usize = 100_000;

/// Bytes of handshake payload used as the dedup key
const HANDSHAKE_PREFIX_LEN: usize = 32;

type DedupKey = (PeerId, u64, [u8; 16]);

/// Sliding-window packet deduplicator
pub struct MessageDeduplicator {
    seen: RwLock<DedupInner>,
    window: Duration,
}

struct DedupInner {
    keys: HashMap<DedupKey, Instant>,
    order: VecDeque<(DedupKey, Instant)>,
    handshakes: HashSet<[u8; HANDSHAKE_PREFIX_LEN]>,
}

/// Statistics about the deduplicator
#[derive(Debug, Clone)]
pub struct DedupStats {
    pub packet_entries: usize,
    pub handshake_entries: usize,
    pub window: Duration,
}

impl MessageDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: RwLock::new(DedupInner {
                keys: HashMap::new(),
                order: VecDeque::new(),
                handshakes: HashSet::new(),
            }),
            window,
        }
    }

    /// First 16 bytes of SHA-256 over the payload
    pub fn payload_hash16(payload: &[u8]) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&digest[..16]);
        hash
    }

    fn key_for(packet: &BitchatPacket) -> DedupKey {
        (
            packet.sender_id,
            packet.timestamp,
            Self::payload_hash16(&packet.payload),
        )
    }

    /// Record the packet; true when it was already seen inside the window
    pub async fn is_duplicate(&self, packet: &BitchatPacket) -> bool {
        let key = Self::key_for(packet);
        let now = Instant::now();

        let mut inner = self.seen.write().await;
        Self::expire(&mut inner, now, self.window);

        if inner.keys.contains_key(&key) {
            return true;
        }

        inner.keys.insert(key, now);
        inner.order.push_back((key, now));

        if inner.order.len() > MAX_DEDUP_ENTRIES {
            if let Some((old_key, _)) = inner.order.pop_front() {
                inner.keys.remove(&old_key);
            }
        }

        false
    }

    /// Record a handshake payload; true when this exact message (by prefix)
    /// was already processed
    pub async fn is_duplicate_handshake(&self, payload: &[u8]) -> bool {
        let mut prefix = [0u8; HANDSHAKE_PREFIX_LEN];
        let len = payload.len().min(HANDSHAKE_PREFIX_LEN);
        prefix[..len].copy_from_slice(&payload[..len]);

        let mut inner = self.seen.write().await;
        if inner.handshakes.len() > MAX_DEDUP_ENTRIES {
            inner.handshakes.clear();
        }
        !inner.handshakes.insert(prefix)
    }

    fn expire(inner: &mut DedupInner, now: Instant, window: Duration) {
        while let Some(&(key, seen_at)) = inner.order.front() {
            if now.duration_since(seen_at) > window {
                inner.order.pop_front();
                inner.keys.remove(&key);
            } else {
                break;
            }
        }
    }

    /// Periodic maintenance: drop expired packet keys and reset the
    /// handshake set to bound memory
    pub async fn sweep(&self) {
        let mut inner = self.seen.write().await;
        let now = Instant::now();
        Self::expire(&mut inner, now, self.window);
        inner.handshakes.clear();
    }

    /// Wipe everything (panic mode)
    pub async fn clear(&self) {
        let mut inner = self.seen.write().await;
        inner.keys.clear();
        inner.order.clear();
        inner.handshakes.clear();
    }

    pub async fn stats(&self) -> DedupStats {
        let inner = self.seen.read().await;
        DedupStats {
            packet_entries: inner.keys.len(),
            handshake_entries: inner.handshakes.len(),
            window: self.window,
        }
    }
}
