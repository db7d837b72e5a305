//! Mesh service: the host-facing orchestrator
//!
//! Wires the connection manager, packet processor, message handler,
//! security manager, peer table and store-and-forward cache together, and
//! exposes the host API: start/stop, broadcast and private sends, receipts,
//! handshake initiation, peer-ID rotation and panic wipe. Upcalls are a
//! broadcast channel of [`MeshEvent`]; host queries come in through the
//! [`HostInterface`] trait object supplied at construction.

pub mod handler;
pub mod peers;
pub mod processor;
pub mod relay;
pub mod store_forward;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;

use crate::config::MeshConfig;
use crate::crypto::BitchatIdentity;
use crate::error::{Error, Result};
use crate::protocol::message::{BitchatMessage, DeliveryAck, HandshakeRequest, ReadReceipt};
use crate::protocol::{
    now_millis, peer_id_to_hex, BitchatPacket, PeerId, RoutedPacket, ANNOUNCE_TTL, DIRECT_TTL,
    MAX_TTL, MESSAGE_TYPE_ANNOUNCE, MESSAGE_TYPE_HANDSHAKE_REQUEST, MESSAGE_TYPE_LEAVE,
    MESSAGE_TYPE_MESSAGE, MESSAGE_TYPE_NOISE_ENCRYPTED, MESSAGE_TYPE_NOISE_HANDSHAKE_INIT,
    MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE, MESSAGE_TYPE_READ_RECEIPT,
};
use crate::session::SecurityManager;
use crate::transport::{ConnectionManager, TransportEvent};

pub use handler::MessageHandler;
pub use peers::{FingerprintRegistry, PeerManager, PeerRecord};
pub use processor::PacketProcessor;
pub use relay::{RelayDecision, RelayManager};
pub use store_forward::{StoreForwardCache, StoreForwardStats, StoredMessage};

/// Capabilities the host application supplies to the mesh core
pub trait HostInterface: Send + Sync {
    /// Our display nickname
    fn nickname(&self) -> String;

    /// Whether this peer is marked for preferential offline caching
    fn is_favorite(&self, peer_id: &PeerId) -> bool;

    /// Decrypt password-protected channel content; `None` when the host
    /// has no key for the channel
    fn decrypt_channel(&self, ciphertext: &[u8], channel: &str) -> Option<String>;
}

/// Events emitted by the mesh service
#[derive(Debug, Clone)]
pub enum MeshEvent {
    MessageReceived {
        message: BitchatMessage,
        from_peer: PeerId,
    },
    PeerConnected {
        peer_id: PeerId,
        nickname: String,
    },
    PeerDisconnected {
        peer_id: PeerId,
        nickname: String,
    },
    PeerListUpdated {
        peers: Vec<PeerId>,
    },
    ChannelLeave {
        channel: String,
        from_peer: PeerId,
    },
    DeliveryAck {
        ack: DeliveryAck,
    },
    ReadReceipt {
        receipt: ReadReceipt,
    },
}

/// Statistics tracked by the mesh service
#[derive(Debug, Default, Clone)]
pub struct MeshStatistics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub active_peers: usize,
}

/// Core mesh service orchestrator
pub struct MeshService {
    config: MeshConfig,
    identity: Arc<RwLock<BitchatIdentity>>,
    security: Arc<SecurityManager>,
    peers: Arc<PeerManager>,
    store: Arc<StoreForwardCache>,
    connection: Arc<ConnectionManager>,
    processor: Arc<PacketProcessor>,
    host: Arc<dyn HostInterface>,
    event_tx: broadcast::Sender<MeshEvent>,
    outbound_tx: mpsc::UnboundedSender<RoutedPacket>,
    outbound_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RoutedPacket>>>,
    intake_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RoutedPacket>>>,
    is_running: Arc<RwLock<bool>>,
    stats: Arc<RwLock<MeshStatistics>>,
}

impl MeshService {
    /// Assemble the service. The identity loads from `config.data_dir` when
    /// set, otherwise lives only in memory.
    pub fn new(
        config: MeshConfig,
        host: Arc<dyn HostInterface>,
        connection: Arc<ConnectionManager>,
    ) -> Result<Self> {
        let identity = match &config.data_dir {
            Some(dir) => BitchatIdentity::load_or_generate(dir)?,
            None => BitchatIdentity::generate()?,
        };
        log::info!(
            "mesh identity: peer {} fingerprint {}",
            peer_id_to_hex(&identity.peer_id),
            &identity.fingerprint()[..16]
        );
        let identity = Arc::new(RwLock::new(identity));

        let security = Arc::new(SecurityManager::new(
            identity.clone(),
            config.dedup_window,
            config.timestamp_tolerance,
        ));
        let peers = Arc::new(PeerManager::new(config.stale_peer_timeout));
        let store = Arc::new(StoreForwardCache::new(
            config.max_cached_messages,
            config.cached_message_ttl,
            config.max_cached_messages_per_favorite,
        ));
        let relay = Arc::new(RelayManager::new(
            config.relay_delay_min,
            config.relay_delay_max,
        ));

        let (event_tx, _) = broadcast::channel(1024);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(RwLock::new(MeshStatistics::default()));

        let handler = Arc::new(MessageHandler::new(
            identity.clone(),
            security.clone(),
            peers.clone(),
            store.clone(),
            relay,
            connection.clone(),
            host.clone(),
            event_tx.clone(),
            outbound_tx.clone(),
            intake_tx,
            stats.clone(),
            config.flush_spacing,
        ));
        let processor = Arc::new(PacketProcessor::new(
            handler,
            security.clone(),
            peers.clone(),
        ));

        Ok(Self {
            config,
            identity,
            security,
            peers,
            store,
            connection,
            processor,
            host,
            event_tx,
            outbound_tx,
            outbound_rx: std::sync::Mutex::new(Some(outbound_rx)),
            intake_rx: std::sync::Mutex::new(Some(intake_rx)),
            is_running: Arc::new(RwLock::new(false)),
            stats,
        })
    }

    /// Subscribe to mesh events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    pub async fn local_peer_id(&self) -> PeerId {
        self.identity.read().await.peer_id
    }

    pub async fn fingerprint(&self) -> String {
        self.identity.read().await.fingerprint()
    }

    /// Bring the radio up and start every background task
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        self.connection.clone().start().await?;

        // Transport events: inbound packets enter the per-peer lanes,
        // link-ups trigger our presence broadcast
        let mut transport_events = self
            .connection
            .take_events()
            .ok_or_else(|| Error::InvalidState("transport events already taken".to_string()))?;
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_events.recv().await {
                match event {
                    TransportEvent::PacketReceived { routed } => {
                        service.processor.submit(routed);
                    }
                    TransportEvent::DeviceConnected { address } => {
                        log::debug!("link up: {}", address);
                        service.send_presence().await;
                    }
                    TransportEvent::DeviceDisconnected { address, reason } => {
                        log::debug!("link down: {} ({})", address, reason);
                    }
                }
            }
        });

        // Re-injected inner packets ride the same lanes as radio packets
        let mut intake_rx = self
            .intake_rx
            .lock()
            .map_err(|_| Error::InvalidState("intake receiver poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::InvalidState("intake receiver already taken".to_string()))?;
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(routed) = intake_rx.recv().await {
                service.processor.submit(routed);
            }
        });

        // Single outbound funnel: preserves submission order per device
        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .map_err(|_| Error::InvalidState("outbound receiver poisoned".to_string()))?
            .take()
            .ok_or_else(|| Error::InvalidState("outbound receiver already taken".to_string()))?;
        let connection = self.connection.clone();
        tokio::spawn(async move {
            while let Some(routed) = outbound_rx.recv().await {
                if let Err(e) = connection.send_packet(&routed).await {
                    log::debug!("outbound send failed: {}", e);
                }
            }
        });

        self.clone().spawn_maintenance_task();
        self.clone().spawn_announce_task();

        self.send_presence().await;
        log::info!("mesh service started");
        Ok(())
    }

    /// Leave the mesh gracefully and tear everything down
    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }

        let our_id = self.local_peer_id().await;
        self.send_out(BitchatPacket::new_broadcast(
            MESSAGE_TYPE_LEAVE,
            our_id,
            ANNOUNCE_TTL,
            self.host.nickname().into_bytes(),
        ));
        // Let the leave hit the radio before links drop
        tokio::time::sleep(Duration::from_millis(50)).await;

        self.connection.stop().await;
        self.processor.shutdown();
        log::info!("mesh service stopped");
    }

    /// Send a public message to the whole mesh
    pub async fn send_broadcast(
        &self,
        content: &str,
        mentions: Option<Vec<String>>,
        channel: Option<String>,
    ) -> Result<String> {
        let our_id = self.local_peer_id().await;
        let message_id = uuid::Uuid::new_v4().to_string();

        let mut message = BitchatMessage::new(
            message_id.clone(),
            self.host.nickname(),
            content.to_string(),
            now_millis(),
        );
        message.sender_peer_id = Some(peer_id_to_hex(&our_id));
        message.mentions = mentions.filter(|m| !m.is_empty());
        message.channel = channel;

        let packet = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            our_id,
            MAX_TTL,
            message.encode()?,
        );
        self.send_out(packet);
        self.stats.write().await.messages_sent += 1;
        Ok(message_id)
    }

    /// Send a private message end-to-end encrypted to one peer. Without an
    /// established session the message is cached and a HANDSHAKE_REQUEST
    /// goes out instead.
    pub async fn send_private(
        &self,
        content: &str,
        recipient: PeerId,
        recipient_nickname: &str,
        message_id: Option<String>,
    ) -> Result<String> {
        let our_id = self.local_peer_id().await;
        let message_id = message_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut message = BitchatMessage::new(
            message_id.clone(),
            self.host.nickname(),
            content.to_string(),
            now_millis(),
        );
        message.is_private = true;
        message.recipient_nickname = Some(recipient_nickname.to_string());
        message.sender_peer_id = Some(peer_id_to_hex(&our_id));

        let inner = BitchatPacket::new_direct(
            MESSAGE_TYPE_MESSAGE,
            our_id,
            recipient,
            MAX_TTL,
            message.encode()?,
        );
        let inner_bytes = crate::protocol::binary::BinaryProtocol::encode(&inner)?;

        let outbound = self.outbound_tx.clone();
        let encrypted = self
            .security
            .encrypt_for_with(recipient, &inner_bytes, |ciphertext| {
                let _ = outbound.send(RoutedPacket::local(BitchatPacket::new_direct(
                    MESSAGE_TYPE_NOISE_ENCRYPTED,
                    our_id,
                    recipient,
                    MAX_TTL,
                    ciphertext,
                )));
            })
            .await;
        match encrypted {
            Ok(()) => {
                self.stats.write().await.messages_sent += 1;
            }
            Err(Error::NoSession(_)) => {
                let favorite = self.host.is_favorite(&recipient);
                self.store
                    .cache(inner, message_id.clone(), favorite)
                    .await;
                let pending = self.store.pending_for(&recipient).await;
                log::info!(
                    "no session with {}; queued ({} pending) and requesting handshake",
                    peer_id_to_hex(&recipient),
                    pending
                );

                let request = HandshakeRequest {
                    requester_nickname: self.host.nickname(),
                    pending_count: pending.min(u16::MAX as usize) as u16,
                };
                self.send_out(BitchatPacket::new_direct(
                    MESSAGE_TYPE_HANDSHAKE_REQUEST,
                    our_id,
                    recipient,
                    MAX_TTL,
                    request.encode()?,
                ));

                // Only self-initiate toward a reachable direct neighbor;
                // otherwise the HANDSHAKE_REQUEST (or a later identity
                // announcement) triggers the handshake from their side
                if self.connection.is_peer_connected(&recipient)
                    && SecurityManager::should_initiate(&our_id, &recipient)
                {
                    self.initiate_handshake(recipient).await?;
                }
            }
            Err(e) => return Err(e),
        }
        Ok(message_id)
    }

    /// Send a read receipt through the Noise envelope
    pub async fn send_read_receipt(
        &self,
        message_id: &str,
        peer: PeerId,
        reader_nickname: &str,
    ) -> Result<()> {
        let receipt = ReadReceipt {
            message_id: message_id.to_string(),
            reader_nickname: reader_nickname.to_string(),
            timestamp: now_millis(),
        };
        let body = receipt.encode()?;
        let mut plaintext = Vec::with_capacity(1 + body.len());
        plaintext.push(MESSAGE_TYPE_READ_RECEIPT);
        plaintext.extend_from_slice(&body);

        let our_id = self.local_peer_id().await;
        let outbound = self.outbound_tx.clone();
        let encrypted = self
            .security
            .encrypt_for_with(peer, &plaintext, |ciphertext| {
                let _ = outbound.send(RoutedPacket::local(BitchatPacket::new_direct(
                    MESSAGE_TYPE_NOISE_ENCRYPTED,
                    our_id,
                    peer,
                    MAX_TTL,
                    ciphertext,
                )));
            })
            .await;
        match encrypted {
            Ok(()) => Ok(()),
            Err(Error::NoSession(_)) => {
                log::debug!(
                    "read receipt for {} dropped: no session",
                    peer_id_to_hex(&peer)
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Begin a Noise handshake with a peer. A bound direct neighbor gets
    /// the neighbor-only TTL; a peer further out floods with the full hop
    /// budget so the handshake can cross the mesh.
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<()> {
        if let Some(first_message) = self.security.initiate(peer).await? {
            let our_id = self.local_peer_id().await;
            let ttl = if self.connection.is_peer_connected(&peer) {
                DIRECT_TTL
            } else {
                MAX_TTL
            };
            self.send_out(BitchatPacket::new_direct(
                MESSAGE_TYPE_NOISE_HANDSHAKE_INIT,
                our_id,
                peer,
                ttl,
                first_message,
            ));
        }
        Ok(())
    }

    /// Rotate our ephemeral peer ID and announce the rotation so neighbors
    /// can rebind session state
    pub async fn rotate_peer_id(&self) -> Result<PeerId> {
        let (announcement, new_id) = {
            let mut identity = self.identity.write().await;
            let previous = identity.rotate_peer_id();
            (
                identity.sign_announcement(&self.host.nickname(), Some(previous)),
                identity.peer_id,
            )
        };

        self.send_out(BitchatPacket::new_broadcast(
            MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE,
            new_id,
            ANNOUNCE_TTL,
            announcement.encode()?,
        ));
        Ok(new_id)
    }

    /// Panic mode: wipe sessions, caches, peers, fingerprints, the replay
    /// set and the persistent identity. Afterwards the service runs as if
    /// freshly started with a brand new identity.
    pub async fn clear_all(&self) -> Result<()> {
        log::warn!("panic wipe requested");
        self.security.clear().await;
        self.store.clear().await;
        self.peers.clear();
        self.connection.clear_bindings();
        self.identity.write().await.wipe_and_regenerate()?;

        self.emit(MeshEvent::PeerListUpdated { peers: Vec::new() });
        *self.stats.write().await = MeshStatistics::default();

        if *self.is_running.read().await {
            self.send_presence().await;
        }
        Ok(())
    }

    /// Announce our nickname and signed identity to the mesh
    async fn send_presence(&self) {
        let (our_id, announcement) = {
            let identity = self.identity.read().await;
            (
                identity.peer_id,
                identity.sign_announcement(&self.host.nickname(), None),
            )
        };

        self.send_out(BitchatPacket::new_broadcast(
            MESSAGE_TYPE_ANNOUNCE,
            our_id,
            ANNOUNCE_TTL,
            self.host.nickname().into_bytes(),
        ));
        match announcement.encode() {
            Ok(payload) => self.send_out(BitchatPacket::new_broadcast(
                MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE,
                our_id,
                ANNOUNCE_TTL,
                payload,
            )),
            Err(e) => log::warn!("identity announcement encode failed: {}", e),
        }
    }

    fn send_out(&self, packet: BitchatPacket) {
        let _ = self.outbound_tx.send(RoutedPacket::local(packet));
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Periodic upkeep: stale-peer eviction, dedup window reset, rekey
    fn spawn_maintenance_task(self: Arc<Self>) {
        let service = self;
        tokio::spawn(async move {
            let mut ticker = interval(service.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_dedup_sweep = Instant::now();

            loop {
                ticker.tick().await;
                if !*service.is_running.read().await {
                    break;
                }

                let evicted = service.peers.sweep();
                if !evicted.is_empty() {
                    for record in &evicted {
                        service.store.reset_marker(&record.peer_id).await;
                        service.security.remove_session(&record.peer_id).await;
                        if record.announced {
                            service.emit(MeshEvent::PeerDisconnected {
                                peer_id: record.peer_id,
                                nickname: record.nickname.clone(),
                            });
                        }
                    }
                    service.emit(MeshEvent::PeerListUpdated {
                        peers: service.peers.active_peers(),
                    });
                }

                if last_dedup_sweep.elapsed() >= service.config.dedup_window {
                    service.security.sweep().await;
                    last_dedup_sweep = Instant::now();
                }

                for peer in service.security.sessions_needing_rekey().await {
                    match service.security.rekey(peer).await {
                        Ok(first_message) => {
                            let our_id = service.local_peer_id().await;
                            service.send_out(BitchatPacket::new_direct(
                                MESSAGE_TYPE_NOISE_HANDSHAKE_INIT,
                                our_id,
                                peer,
                                MAX_TTL,
                                first_message,
                            ));
                        }
                        Err(e) => log::debug!("rekey with {} deferred: {}", peer_id_to_hex(&peer), e),
                    }
                }
            }
        });
    }

    /// Periodic re-announcement so late joiners learn nicknames
    fn spawn_announce_task(self: Arc<Self>) {
        let service = self;
        tokio::spawn(async move {
            let mut ticker = interval(service.config.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick duplicates start()'s presence
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !*service.is_running.read().await {
                    break;
                }
                service.send_presence().await;
            }
        });
    }

    /// Current statistics snapshot
    pub async fn get_stats(&self) -> MeshStatistics {
        let mut stats = self.stats.read().await.clone();
        stats.active_peers = self.peers.active_count();
        stats
    }

    pub async fn connection_stats(&self) -> crate::transport::ConnectionStats {
        self.connection.connection_stats().await
    }

    pub async fn store_stats(&self) -> StoreForwardStats {
        self.store.stats().await
    }

    /// Read-only peer queries for the host
    pub fn peer_nickname(&self, peer_id: &PeerId) -> Option<String> {
        self.peers.nickname_of(peer_id)
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.peers.active_peers()
    }

    pub async fn peer_fingerprint(&self, peer_id: &PeerId) -> Option<String> {
        self.peers.registry().fingerprint_of(peer_id)
    }

    pub async fn is_session_established(&self, peer_id: &PeerId) -> bool {
        self.security.is_established(peer_id).await
    }
}
