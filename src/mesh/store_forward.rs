//! Store-and-forward cache for offline recipients
//!
//! Two policies: a bounded FIFO for regular peers (cap 100, 12 h TTL) and
//! per-favorite queues (cap 1000 each, no TTL). Only unicast MESSAGE
//! packets are cached; announces, leaves and handshakes never are. A
//! per-recipient "sent" marker prevents double-flushing within a session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::protocol::{peer_id_to_hex, BitchatPacket, PeerId, MESSAGE_TYPE_MESSAGE};

/// A cached message awaiting an offline recipient
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub packet: BitchatPacket,
    pub cached_at: Instant,
    pub message_id: String,
    pub for_favorite: bool,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct StoreForwardStats {
    pub regular_cached: usize,
    pub favorite_cached: usize,
    pub favorite_recipients: usize,
}

struct CacheInner {
    regular: VecDeque<StoredMessage>,
    favorites: HashMap<PeerId, VecDeque<StoredMessage>>,
    sent_markers: HashSet<PeerId>,
}

/// Offline message cache with distinct favorite and regular policies
pub struct StoreForwardCache {
    inner: Mutex<CacheInner>,
    max_regular: usize,
    regular_ttl: Duration,
    max_per_favorite: usize,
}

impl StoreForwardCache {
    pub fn new(max_regular: usize, regular_ttl: Duration, max_per_favorite: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                regular: VecDeque::new(),
                favorites: HashMap::new(),
                sent_markers: HashSet::new(),
            }),
            max_regular,
            regular_ttl,
            max_per_favorite,
        }
    }

    /// Cache a message for an offline recipient. Returns false for packets
    /// that are not cacheable (non-MESSAGE types, broadcasts).
    pub async fn cache(&self, packet: BitchatPacket, message_id: String, for_favorite: bool) -> bool {
        if packet.packet_type != MESSAGE_TYPE_MESSAGE || packet.is_broadcast() {
            return false;
        }
        let Some(recipient) = packet.recipient_id else {
            return false;
        };

        let entry = StoredMessage {
            packet,
            cached_at: Instant::now(),
            message_id,
            for_favorite,
        };

        let mut inner = self.inner.lock().await;
        // A fresh message for this recipient re-arms the flush
        inner.sent_markers.remove(&recipient);

        if for_favorite {
            let queue = inner.favorites.entry(recipient).or_default();
            if queue.len() >= self.max_per_favorite {
                queue.pop_front();
            }
            queue.push_back(entry);
        } else {
            // Purge expired entries on every write
            let ttl = self.regular_ttl;
            let now = Instant::now();
            inner
                .regular
                .retain(|cached| now.duration_since(cached.cached_at) < ttl);

            if inner.regular.len() >= self.max_regular {
                inner.regular.pop_front();
            }
            inner.regular.push_back(entry);
        }
        log::debug!(
            "cached message for offline peer {} (favorite: {})",
            peer_id_to_hex(&recipient),
            for_favorite
        );
        true
    }

    /// Number of messages waiting for one recipient
    pub async fn pending_for(&self, peer_id: &PeerId) -> usize {
        let inner = self.inner.lock().await;
        let regular = inner
            .regular
            .iter()
            .filter(|m| m.packet.recipient_id.as_ref() == Some(peer_id))
            .count();
        let favorite = inner
            .favorites
            .get(peer_id)
            .map(|q| q.len())
            .unwrap_or(0);
        regular + favorite
    }

    /// Drain everything queued for `peer_id` in timestamp order. Returns an
    /// empty list when the peer was already flushed this session.
    pub async fn flush_for(&self, peer_id: &PeerId) -> Vec<StoredMessage> {
        let mut inner = self.inner.lock().await;
        if inner.sent_markers.contains(peer_id) {
            return Vec::new();
        }

        let mut drained: Vec<StoredMessage> = Vec::new();

        let mut keep = VecDeque::with_capacity(inner.regular.len());
        for message in inner.regular.drain(..) {
            if message.packet.recipient_id.as_ref() == Some(peer_id) {
                drained.push(message);
            } else {
                keep.push_back(message);
            }
        }
        inner.regular = keep;

        if let Some(queue) = inner.favorites.remove(peer_id) {
            drained.extend(queue);
        }

        if drained.is_empty() {
            return drained;
        }

        inner.sent_markers.insert(*peer_id);
        drained.sort_by_key(|m| m.packet.timestamp);
        log::info!(
            "flushing {} cached messages to {}",
            drained.len(),
            peer_id_to_hex(peer_id)
        );
        drained
    }

    /// Return undeliverable messages to the cache and re-arm the flush
    pub async fn requeue(&self, peer_id: &PeerId, messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.sent_markers.remove(peer_id);
        for message in messages {
            if message.for_favorite {
                inner
                    .favorites
                    .entry(*peer_id)
                    .or_default()
                    .push_back(message);
            } else {
                inner.regular.push_back(message);
            }
        }
    }

    /// Forget the sent marker (peer went away; a new session may flush again)
    pub async fn reset_marker(&self, peer_id: &PeerId) {
        self.inner.lock().await.sent_markers.remove(peer_id);
    }

    /// Re-key queued messages across a peer-ID rotation
    pub async fn migrate(&self, old_peer: &PeerId, new_peer: PeerId) {
        let mut inner = self.inner.lock().await;
        if let Some(mut queue) = inner.favorites.remove(old_peer) {
            for message in queue.iter_mut() {
                message.packet.recipient_id = Some(new_peer);
            }
            inner.favorites.insert(new_peer, queue);
        }
        for message in inner.regular.iter_mut() {
            if message.packet.recipient_id.as_ref() == Some(old_peer) {
                message.packet.recipient_id = Some(new_peer);
            }
        }
        if inner.sent_markers.remove(old_peer) {
            inner.sent_markers.insert(new_peer);
        }
    }

    pub async fn stats(&self) -> StoreForwardStats {
        let inner = self.inner.lock().await;
        StoreForwardStats {
            regular_cached: inner.regular.len(),
            favorite_cached: inner.favorites.values().map(|q| q.len()).sum(),
            favorite_recipients: inner.favorites.len(),
        }
    }

    /// Panic mode: drop everything
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.regular.clear();
        inner.favorites.clear();
        inner.sent_markers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MAX_TTL, MESSAGE_TYPE_ANNOUNCE};

    fn unicast(recipient: u8, timestamp: u64) -> BitchatPacket {
        let mut packet = BitchatPacket::new_direct(
            MESSAGE_TYPE_MESSAGE,
            [1u8; 8],
            [recipient; 8],
            MAX_TTL,
            b"queued".to_vec(),
        );
        packet.timestamp = timestamp;
        packet
    }

    fn cache() -> StoreForwardCache {
        StoreForwardCache::new(100, Duration::from_secs(12 * 3600), 1000)
    }

    #[tokio::test]
    async fn test_only_unicast_messages_cached() {
        let store = cache();
        assert!(store.cache(unicast(2, 1), "a".to_string(), false).await);

        let broadcast = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            [1u8; 8],
            MAX_TTL,
            b"x".to_vec(),
        );
        assert!(!store.cache(broadcast, "b".to_string(), false).await);

        let announce = BitchatPacket::new_direct(
            MESSAGE_TYPE_ANNOUNCE,
            [1u8; 8],
            [2u8; 8],
            MAX_TTL,
            b"nick".to_vec(),
        );
        assert!(!store.cache(announce, "c".to_string(), false).await);
    }

    #[tokio::test]
    async fn test_regular_cache_fifo_eviction() {
        let store = StoreForwardCache::new(3, Duration::from_secs(3600), 10);
        for i in 0..5u64 {
            store
                .cache(unicast(2, i), format!("m{}", i), false)
                .await;
        }
        let stats = store.stats().await;
        assert_eq!(stats.regular_cached, 3);

        let flushed = store.flush_for(&[2u8; 8]).await;
        // Oldest two were evicted
        assert_eq!(
            flushed.iter().map(|m| m.packet.timestamp).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[tokio::test]
    async fn test_flush_in_timestamp_order_across_caches() {
        let store = cache();
        store.cache(unicast(2, 30), "m3".to_string(), true).await;
        store.cache(unicast(2, 10), "m1".to_string(), false).await;
        store.cache(unicast(2, 20), "m2".to_string(), true).await;

        let flushed = store.flush_for(&[2u8; 8]).await;
        assert_eq!(
            flushed.iter().map(|m| m.packet.timestamp).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
    }

    #[tokio::test]
    async fn test_sent_marker_prevents_double_flush() {
        let store = cache();
        store.cache(unicast(2, 1), "m1".to_string(), false).await;
        assert_eq!(store.flush_for(&[2u8; 8]).await.len(), 1);
        // Marker set, nothing new arrived
        assert!(store.flush_for(&[2u8; 8]).await.is_empty());

        // A fresh message re-arms the flush
        store.cache(unicast(2, 2), "m2".to_string(), false).await;
        assert_eq!(store.flush_for(&[2u8; 8]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_favorite_cap_applies_per_recipient() {
        let store = StoreForwardCache::new(10, Duration::from_secs(3600), 2);
        for i in 0..4u64 {
            store
                .cache(unicast(2, i), format!("m{}", i), true)
                .await;
        }
        store.cache(unicast(3, 9), "other".to_string(), true).await;

        let flushed = store.flush_for(&[2u8; 8]).await;
        assert_eq!(
            flushed.iter().map(|m| m.packet.timestamp).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(store.flush_for(&[3u8; 8]).await.len(), 1);
    }

    #[tokio::test]
    async fn test_regular_ttl_purged_on_write() {
        let store = StoreForwardCache::new(10, Duration::from_millis(20), 10);
        store.cache(unicast(2, 1), "old".to_string(), false).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.cache(unicast(2, 2), "new".to_string(), false).await;

        let flushed = store.flush_for(&[2u8; 8]).await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].packet.timestamp, 2);
    }

    #[tokio::test]
    async fn test_migrate_rekeys_queued_messages() {
        let store = cache();
        store.cache(unicast(2, 1), "m1".to_string(), true).await;
        store.cache(unicast(2, 2), "m2".to_string(), false).await;

        store.migrate(&[2u8; 8], [9u8; 8]).await;
        assert_eq!(store.pending_for(&[2u8; 8]).await, 0);

        let flushed = store.flush_for(&[9u8; 8]).await;
        assert_eq!(flushed.len(), 2);
        assert!(flushed
            .iter()
            .all(|m| m.packet.recipient_id == Some([9u8; 8])));
    }

    #[tokio::test]
    async fn test_requeue_restores_messages() {
        let store = cache();
        store.cache(unicast(2, 1), "m1".to_string(), false).await;
        let flushed = store.flush_for(&[2u8; 8]).await;
        assert_eq!(flushed.len(), 1);

        store.requeue(&[2u8; 8], flushed).await;
        assert_eq!(store.flush_for(&[2u8; 8]).await.len(), 1);
    }
}
