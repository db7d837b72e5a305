//! Active peer table and fingerprint registry
//!
//! The peer manager exclusively owns the peer records; other components
//! consult it through read-only queries that return clones. A background
//! sweep (driven by the mesh service) evicts records whose `last_seen`
//! exceeds the staleness timeout.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::crypto::fingerprint;
use crate::protocol::{peer_id_to_hex, PeerId};

/// One record per active peer ID
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub nickname: String,
    pub last_seen: Instant,
    pub rssi: Option<i16>,
    /// We surfaced `peer_connected` for this record
    pub announced: bool,
    /// We sent our own ANNOUNCE toward this peer
    pub announced_to: bool,
    pub fingerprint: Option<String>,
}

/// Maps Noise static keys to fingerprints and peer IDs to fingerprints.
/// Fingerprints survive peer-ID rotation; records do not.
#[derive(Default)]
pub struct FingerprintRegistry {
    by_peer: DashMap<PeerId, String>,
    by_fingerprint: DashMap<String, PeerId>,
}

impl FingerprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a peer ID to the fingerprint of a static key, replacing any
    /// stale binding either way
    pub fn bind(&self, peer_id: PeerId, static_public_key: &[u8]) -> String {
        let fp = fingerprint(static_public_key);
        if let Some(previous_peer) = self.by_fingerprint.insert(fp.clone(), peer_id) {
            if previous_peer != peer_id {
                self.by_peer.remove(&previous_peer);
            }
        }
        self.by_peer.insert(peer_id, fp.clone());
        fp
    }

    pub fn fingerprint_of(&self, peer_id: &PeerId) -> Option<String> {
        self.by_peer.get(peer_id).map(|e| e.value().clone())
    }

    pub fn peer_for(&self, fp: &str) -> Option<PeerId> {
        self.by_fingerprint.get(fp).map(|e| *e.value())
    }

    pub fn unbind_peer(&self, peer_id: &PeerId) {
        if let Some((_, fp)) = self.by_peer.remove(peer_id) {
            // Only clear the reverse edge if it still points at us
            if self.by_fingerprint.get(&fp).map(|e| *e.value()) == Some(*peer_id) {
                self.by_fingerprint.remove(&fp);
            }
        }
    }

    pub fn clear(&self) {
        self.by_peer.clear();
        self.by_fingerprint.clear();
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }
}

/// Thread-safe peer table
pub struct PeerManager {
    peers: DashMap<PeerId, PeerRecord>,
    registry: Arc<FingerprintRegistry>,
    stale_timeout: Duration,
}

impl PeerManager {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            registry: Arc::new(FingerprintRegistry::new()),
            stale_timeout,
        }
    }

    pub fn registry(&self) -> Arc<FingerprintRegistry> {
        self.registry.clone()
    }

    /// Add or refresh a peer; returns true when this is a new record
    /// (the caller surfaces `peer_connected` exactly once per record)
    pub fn upsert(&self, peer_id: PeerId, nickname: &str) -> bool {
        let mut is_new = false;
        self.peers
            .entry(peer_id)
            .and_modify(|record| {
                record.nickname = nickname.to_string();
                record.last_seen = Instant::now();
            })
            .or_insert_with(|| {
                is_new = true;
                PeerRecord {
                    peer_id,
                    nickname: nickname.to_string(),
                    last_seen: Instant::now(),
                    rssi: None,
                    announced: false,
                    announced_to: false,
                    fingerprint: self.registry.fingerprint_of(&peer_id),
                }
            });
        if is_new {
            log::info!("peer {} ({}) active", peer_id_to_hex(&peer_id), nickname);
        }
        is_new
    }

    /// Refresh last-seen without touching anything else
    pub fn touch(&self, peer_id: &PeerId) {
        if let Some(mut record) = self.peers.get_mut(peer_id) {
            record.last_seen = Instant::now();
        }
    }

    pub fn set_rssi(&self, peer_id: &PeerId, rssi: i16) {
        if let Some(mut record) = self.peers.get_mut(peer_id) {
            record.rssi = Some(rssi);
        }
    }

    /// Mark that we surfaced `peer_connected`; returns false when it was
    /// already marked
    pub fn mark_announced(&self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) if !record.announced => {
                record.announced = true;
                true
            }
            _ => false,
        }
    }

    /// Mark that our ANNOUNCE went out toward this peer; returns false when
    /// it was already marked
    pub fn mark_announced_to(&self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) if !record.announced_to => {
                record.announced_to = true;
                true
            }
            _ => false,
        }
    }

    /// Bind the fingerprint of `static_public_key` to this peer
    pub fn bind_fingerprint(&self, peer_id: PeerId, static_public_key: &[u8]) -> String {
        let fp = self.registry.bind(peer_id, static_public_key);
        if let Some(mut record) = self.peers.get_mut(&peer_id) {
            record.fingerprint = Some(fp.clone());
        }
        fp
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|r| r.value().clone())
    }

    pub fn nickname_of(&self, peer_id: &PeerId) -> Option<String> {
        self.peers.get(peer_id).map(|r| r.value().nickname.clone())
    }

    /// Remove a record (LEAVE or rotation); returns it for the upcall
    pub fn remove(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.registry.unbind_peer(peer_id);
        self.peers.remove(peer_id).map(|(_, record)| record)
    }

    /// Migrate a record across a peer-ID rotation without a disconnect
    /// upcall. The fingerprint binding follows the new ID.
    pub fn migrate(&self, old_peer: &PeerId, new_peer: PeerId, nickname: &str) {
        let previous = self.peers.remove(old_peer).map(|(_, record)| record);
        let now = Instant::now();
        let record = match previous {
            Some(mut record) => {
                record.peer_id = new_peer;
                record.nickname = nickname.to_string();
                record.last_seen = now;
                record
            }
            None => PeerRecord {
                peer_id: new_peer,
                nickname: nickname.to_string(),
                last_seen: now,
                rssi: None,
                announced: true,
                announced_to: false,
                fingerprint: None,
            },
        };
        self.peers.insert(new_peer, record);
        if let Some(fp) = self.registry.fingerprint_of(old_peer) {
            self.registry.unbind_peer(old_peer);
            self.by_fingerprint_rebind(new_peer, fp);
        }
    }

    fn by_fingerprint_rebind(&self, peer_id: PeerId, fp: String) {
        self.registry.by_peer.insert(peer_id, fp.clone());
        self.registry.by_fingerprint.insert(fp.clone(), peer_id);
        if let Some(mut record) = self.peers.get_mut(&peer_id) {
            record.fingerprint = Some(fp);
        }
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|r| *r.key()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.peers.len()
    }

    /// Evict records not seen within the staleness timeout; returns the
    /// evicted records so the caller can fire `peer_disconnected` once each
    pub fn sweep(&self) -> Vec<PeerRecord> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|r| now.duration_since(r.value().last_seen) > self.stale_timeout)
            .map(|r| *r.key())
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for peer_id in stale {
            if let Some(record) = self.remove(&peer_id) {
                log::info!(
                    "evicting stale peer {} ({})",
                    peer_id_to_hex(&peer_id),
                    record.nickname
                );
                evicted.push(record);
            }
        }
        evicted
    }

    /// Panic mode: drop every record and fingerprint binding
    pub fn clear(&self) {
        self.peers.clear();
        self.registry.clear();
    }
}
