//! Per-type message semantics
//!
//! The handler owns what happens to each validated packet: peer
//! bookkeeping for announces and leaves, surfacing chat messages, feeding
//! handshake payloads to the security manager, unwrapping Noise envelopes,
//! reassembling fragments, and deferring every rebroadcast decision to the
//! relay manager. Its only way back into the processor is the re-inject
//! channel used for decrypted inner packets and reassembled fragments.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

use super::peers::PeerManager;
use super::relay::{RelayDecision, RelayManager};
use super::store_forward::StoreForwardCache;
use super::{HostInterface, MeshEvent, MeshStatistics};
use crate::crypto::{verify_announcement, BitchatIdentity};
use crate::error::{Error, Result};
use crate::protocol::announce::NoiseIdentityAnnouncement;
use crate::protocol::binary::BinaryProtocol;
use crate::protocol::fragment::FragmentManager;
use crate::protocol::message::{BitchatMessage, DeliveryAck, HandshakeRequest, ReadReceipt};
use crate::protocol::{
    now_millis, peer_id_to_hex, BitchatPacket, PeerId, RoutedPacket, ANNOUNCE_TTL, MAX_TTL,
    MESSAGE_TYPE_ANNOUNCE, MESSAGE_TYPE_DELIVERY_ACK, MESSAGE_TYPE_FRAGMENT_CONTINUE,
    MESSAGE_TYPE_FRAGMENT_END, MESSAGE_TYPE_FRAGMENT_START, MESSAGE_TYPE_HANDSHAKE_REQUEST,
    MESSAGE_TYPE_LEAVE, MESSAGE_TYPE_MESSAGE, MESSAGE_TYPE_NOISE_ENCRYPTED,
    MESSAGE_TYPE_NOISE_HANDSHAKE_INIT, MESSAGE_TYPE_NOISE_HANDSHAKE_RESP,
    MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE, MESSAGE_TYPE_READ_RECEIPT,
};
use crate::session::SecurityManager;
use crate::transport::ConnectionManager;

/// Dispatches validated packets by type
pub struct MessageHandler {
    identity: Arc<RwLock<BitchatIdentity>>,
    security: Arc<SecurityManager>,
    peers: Arc<PeerManager>,
    store: Arc<StoreForwardCache>,
    relay: Arc<RelayManager>,
    connection: Arc<ConnectionManager>,
    host: Arc<dyn HostInterface>,
    events: broadcast::Sender<MeshEvent>,
    outbound_tx: mpsc::UnboundedSender<RoutedPacket>,
    /// Sole upcall into the processor: re-injection of inner packets
    reinject_tx: mpsc::UnboundedSender<RoutedPacket>,
    fragments: FragmentManager,
    stats: Arc<RwLock<MeshStatistics>>,
    flush_spacing: Duration,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<RwLock<BitchatIdentity>>,
        security: Arc<SecurityManager>,
        peers: Arc<PeerManager>,
        store: Arc<StoreForwardCache>,
        relay: Arc<RelayManager>,
        connection: Arc<ConnectionManager>,
        host: Arc<dyn HostInterface>,
        events: broadcast::Sender<MeshEvent>,
        outbound_tx: mpsc::UnboundedSender<RoutedPacket>,
        reinject_tx: mpsc::UnboundedSender<RoutedPacket>,
        stats: Arc<RwLock<MeshStatistics>>,
        flush_spacing: Duration,
    ) -> Self {
        Self {
            identity,
            security,
            peers,
            store,
            relay,
            connection,
            host,
            events,
            outbound_tx,
            reinject_tx,
            fragments: FragmentManager::new(),
            stats,
            flush_spacing,
        }
    }

    async fn local_peer_id(&self) -> PeerId {
        self.identity.read().await.peer_id
    }

    fn send(&self, packet: BitchatPacket) {
        let _ = self.outbound_tx.send(RoutedPacket::local(packet));
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    /// Dispatch one validated packet. `Ok(true)` means a known type was
    /// handled and the immediate sender's last-seen should refresh;
    /// `Ok(false)` means the type was unknown.
    pub async fn handle(&self, routed: RoutedPacket) -> Result<bool> {
        let our_id = self.local_peer_id().await;
        match routed.packet.packet_type {
            MESSAGE_TYPE_ANNOUNCE => self.on_announce(&routed).await?,
            MESSAGE_TYPE_LEAVE => self.on_leave(&routed).await?,
            MESSAGE_TYPE_MESSAGE => self.on_message(&routed, &our_id).await?,
            MESSAGE_TYPE_NOISE_HANDSHAKE_INIT | MESSAGE_TYPE_NOISE_HANDSHAKE_RESP => {
                self.on_handshake(&routed, &our_id).await?
            }
            MESSAGE_TYPE_NOISE_ENCRYPTED => self.on_noise_encrypted(&routed, &our_id).await?,
            MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE => {
                self.on_identity_announce(&routed, &our_id).await?
            }
            MESSAGE_TYPE_FRAGMENT_START
            | MESSAGE_TYPE_FRAGMENT_CONTINUE
            | MESSAGE_TYPE_FRAGMENT_END => self.on_fragment(&routed, &our_id).await?,
            MESSAGE_TYPE_DELIVERY_ACK | MESSAGE_TYPE_READ_RECEIPT => {
                self.on_bare_receipt(&routed, &our_id).await?
            }
            MESSAGE_TYPE_HANDSHAKE_REQUEST => self.on_handshake_request(&routed, &our_id).await?,
            unknown => {
                log::debug!(
                    "unknown packet type 0x{:02x} from {}",
                    unknown,
                    peer_id_to_hex(&routed.packet.sender_id)
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// ANNOUNCE: UTF-8 nickname from the origin peer
    async fn on_announce(&self, routed: &RoutedPacket) -> Result<()> {
        let packet = &routed.packet;
        let nickname = std::str::from_utf8(&packet.payload)
            .map_err(|e| Error::InvalidData(format!("announce nickname: {}", e)))?;

        let is_new = self.peers.upsert(packet.sender_id, nickname);

        // The scan RSSI describes the direct link, so it only applies when
        // the announcer is our immediate neighbor
        if routed.relay_peer == Some(packet.sender_id) {
            if let Some(address) = &routed.relay_address {
                if let Some(rssi) = self.connection.rssi_for_address(address) {
                    self.peers.set_rssi(&packet.sender_id, rssi);
                }
            }
        }

        if is_new && self.peers.mark_announced(&packet.sender_id) {
            self.emit(MeshEvent::PeerConnected {
                peer_id: packet.sender_id,
                nickname: nickname.to_string(),
            });
            self.emit(MeshEvent::PeerListUpdated {
                peers: self.peers.active_peers(),
            });
        }

        // Introduce ourselves once, and drain anything queued if a session
        // already exists (the flush is a no-op otherwise)
        self.send_announce_to(packet.sender_id).await;
        if self.security.is_established(&packet.sender_id).await {
            self.flush_cached(packet.sender_id).await;
        }

        self.maybe_relay(routed).await;
        Ok(())
    }

    /// LEAVE: `#channel` means a channel leave, anything else a disconnect
    async fn on_leave(&self, routed: &RoutedPacket) -> Result<()> {
        let packet = &routed.packet;
        let payload = std::str::from_utf8(&packet.payload)
            .map_err(|e| Error::InvalidData(format!("leave payload: {}", e)))?;

        if let Some(channel) = payload.strip_prefix('#') {
            self.emit(MeshEvent::ChannelLeave {
                channel: format!("#{}", channel),
                from_peer: packet.sender_id,
            });
        } else if let Some(record) = self.peers.remove(&packet.sender_id) {
            self.store.reset_marker(&packet.sender_id).await;
            if record.announced {
                self.emit(MeshEvent::PeerDisconnected {
                    peer_id: packet.sender_id,
                    nickname: record.nickname,
                });
                self.emit(MeshEvent::PeerListUpdated {
                    peers: self.peers.active_peers(),
                });
            }
        }

        self.maybe_relay(routed).await;
        Ok(())
    }

    /// MESSAGE: broadcast content, unicast-to-us, or relay-through
    async fn on_message(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;

        if packet.is_broadcast() {
            let message = self.decode_message(packet)?;
            self.emit(MeshEvent::MessageReceived {
                message,
                from_peer: packet.sender_id,
            });
            self.stats.write().await.messages_received += 1;
            self.maybe_relay(routed).await;
            return Ok(());
        }

        if packet.is_addressed_to(our_id) {
            // Legacy path: a bare unicast MESSAGE without a Noise wrapper
            let message = self.decode_message(packet)?;
            let message_id = message.id.clone();
            self.emit(MeshEvent::MessageReceived {
                message,
                from_peer: packet.sender_id,
            });
            self.stats.write().await.messages_received += 1;
            self.send_delivery_ack(packet.sender_id, &message_id).await;
            return Ok(());
        }

        // Unicast to someone else: relay only
        self.maybe_relay(routed).await;
        Ok(())
    }

    fn decode_message(&self, packet: &BitchatPacket) -> Result<BitchatMessage> {
        let mut message = BitchatMessage::decode(&packet.payload)?;
        // Skewed sender clocks would disorder the conversation view
        message.timestamp = now_millis();

        if let (Some(ciphertext), Some(channel)) =
            (message.encrypted_content.clone(), message.channel.clone())
        {
            if let Some(plaintext) = self.host.decrypt_channel(&ciphertext, &channel) {
                message.content = plaintext;
                message.encrypted_content = None;
            }
        }
        Ok(message)
    }

    /// NOISE_HANDSHAKE_INIT / NOISE_HANDSHAKE_RESP
    async fn on_handshake(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;
        if !packet.is_addressed_to(our_id) {
            self.maybe_relay(routed).await;
            return Ok(());
        }

        let outcome = self
            .security
            .process_handshake(packet.sender_id, packet.packet_type, &packet.payload)
            .await?;

        if let Some(reply) = outcome.reply {
            self.send(BitchatPacket::new_direct(
                MESSAGE_TYPE_NOISE_HANDSHAKE_RESP,
                *our_id,
                packet.sender_id,
                MAX_TTL,
                reply,
            ));
        }

        if outcome.established {
            self.on_session_established(packet.sender_id).await;
        }
        Ok(())
    }

    /// Session establishment: bind the fingerprint, introduce ourselves,
    /// drain the store-and-forward queue with pacing
    async fn on_session_established(&self, peer: PeerId) {
        if let Some(static_key) = self.security.peer_static_key(&peer).await {
            let fp = self.peers.bind_fingerprint(peer, &static_key);
            log::info!(
                "session with {} bound to fingerprint {}",
                peer_id_to_hex(&peer),
                &fp[..16.min(fp.len())]
            );
        }

        self.send_announce_to(peer).await;
        self.flush_cached(peer).await;
    }

    /// NOISE_ENCRYPTED: unwrap and dispatch the inner payload
    async fn on_noise_encrypted(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;
        if !packet.is_addressed_to(our_id) {
            // Not ours to open; unicast-to-others relays like any packet
            self.maybe_relay(routed).await;
            return Ok(());
        }

        let plaintext = self
            .security
            .decrypt_from(packet.sender_id, &packet.payload)
            .await?;

        match plaintext.split_first() {
            Some((&MESSAGE_TYPE_DELIVERY_ACK, body)) => {
                if let Ok(ack) = DeliveryAck::decode(body) {
                    self.emit(MeshEvent::DeliveryAck { ack });
                    return Ok(());
                }
            }
            Some((&MESSAGE_TYPE_READ_RECEIPT, body)) => {
                if let Ok(receipt) = ReadReceipt::decode(body) {
                    self.emit(MeshEvent::ReadReceipt { receipt });
                    return Ok(());
                }
            }
            _ => {}
        }

        // A complete inner packet rides the same lane it arrived on, as if
        // it had been received in the clear from this peer
        let inner = BinaryProtocol::decode(&plaintext)?;
        let _ = self.reinject_tx.send(RoutedPacket {
            packet: inner,
            relay_peer: routed.relay_peer,
            relay_address: routed.relay_address.clone(),
        });
        Ok(())
    }

    /// NOISE_IDENTITY_ANNOUNCE: signed binding of peer ID to identity
    async fn on_identity_announce(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;
        let announcement = NoiseIdentityAnnouncement::decode(&packet.payload)?;

        if announcement.peer_id != packet.sender_id {
            return Err(Error::InvalidData(
                "identity announcement peer does not match packet sender".to_string(),
            ));
        }
        if !verify_announcement(&announcement) {
            return Err(Error::InvalidSignature(format!(
                "identity announcement from {}",
                peer_id_to_hex(&packet.sender_id)
            )));
        }

        match announcement.previous_peer_id {
            Some(previous) if previous != announcement.peer_id => {
                // Rotation: migrate bindings, no disconnect upcall
                log::info!(
                    "peer rotation {} -> {}",
                    peer_id_to_hex(&previous),
                    peer_id_to_hex(&announcement.peer_id)
                );
                self.peers
                    .migrate(&previous, announcement.peer_id, &announcement.nickname);
                self.security
                    .migrate_peer(&previous, announcement.peer_id)
                    .await;
                self.store.migrate(&previous, announcement.peer_id).await;
                if let Some(address) = self.connection.address_for_peer(&previous) {
                    self.connection.bind_peer(&address, announcement.peer_id);
                }
            }
            _ => {
                let is_new = self
                    .peers
                    .upsert(announcement.peer_id, &announcement.nickname);
                if is_new && self.peers.mark_announced(&announcement.peer_id) {
                    self.emit(MeshEvent::PeerConnected {
                        peer_id: announcement.peer_id,
                        nickname: announcement.nickname.clone(),
                    });
                    self.emit(MeshEvent::PeerListUpdated {
                        peers: self.peers.active_peers(),
                    });
                }
            }
        }

        self.peers
            .bind_fingerprint(announcement.peer_id, &announcement.static_public_key);

        // Lower peer ID initiates; ties cannot happen between distinct IDs
        if !self.security.is_established(&announcement.peer_id).await
            && SecurityManager::should_initiate(our_id, &announcement.peer_id)
        {
            self.start_handshake(*our_id, announcement.peer_id).await;
        }

        self.maybe_relay(routed).await;
        Ok(())
    }

    async fn start_handshake(&self, our_id: PeerId, peer: PeerId) {
        match self.security.initiate(peer).await {
            Ok(Some(first_message)) => {
                self.send(BitchatPacket::new_direct(
                    MESSAGE_TYPE_NOISE_HANDSHAKE_INIT,
                    our_id,
                    peer,
                    MAX_TTL,
                    first_message,
                ));
            }
            Ok(None) => {}
            Err(e) => log::debug!("handshake with {} deferred: {}", peer_id_to_hex(&peer), e),
        }
    }

    /// FRAGMENT_*: feed reassembly, relay the fragment regardless
    async fn on_fragment(&self, routed: &RoutedPacket, _our_id: &PeerId) -> Result<()> {
        if let Some(inner) = self.fragments.handle_fragment(&routed.packet).await {
            let _ = self.reinject_tx.send(RoutedPacket {
                packet: inner,
                relay_peer: routed.relay_peer,
                relay_address: routed.relay_address.clone(),
            });
        }
        // Coverage depends on relaying every fragment: only the relayer may
        // overhear the complete series
        self.maybe_relay(routed).await;
        Ok(())
    }

    /// Bare DELIVERY_ACK / READ_RECEIPT addressed to us (legacy peers).
    /// The modern path arrives inside NOISE_ENCRYPTED instead.
    async fn on_bare_receipt(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;
        if !packet.is_addressed_to(our_id) {
            self.maybe_relay(routed).await;
            return Ok(());
        }

        // The payload may arrive plain or session-encrypted by an old peer
        match packet.packet_type {
            MESSAGE_TYPE_DELIVERY_ACK => {
                let ack = match DeliveryAck::decode(&packet.payload) {
                    Ok(ack) => ack,
                    Err(_) => {
                        let decrypted = self
                            .security
                            .decrypt_from(packet.sender_id, &packet.payload)
                            .await?;
                        DeliveryAck::decode(&decrypted)?
                    }
                };
                self.emit(MeshEvent::DeliveryAck { ack });
            }
            _ => {
                let receipt = match ReadReceipt::decode(&packet.payload) {
                    Ok(receipt) => receipt,
                    Err(_) => {
                        let decrypted = self
                            .security
                            .decrypt_from(packet.sender_id, &packet.payload)
                            .await?;
                        ReadReceipt::decode(&decrypted)?
                    }
                };
                self.emit(MeshEvent::ReadReceipt { receipt });
            }
        }
        Ok(())
    }

    /// HANDSHAKE_REQUEST: the requester has messages queued for us and no
    /// session; oblige by initiating
    async fn on_handshake_request(&self, routed: &RoutedPacket, our_id: &PeerId) -> Result<()> {
        let packet = &routed.packet;
        if !packet.is_addressed_to(our_id) {
            self.maybe_relay(routed).await;
            return Ok(());
        }

        let request = HandshakeRequest::decode(&packet.payload)?;
        log::info!(
            "handshake requested by {} ({} pending)",
            request.requester_nickname,
            request.pending_count
        );
        if !self.security.is_established(&packet.sender_id).await {
            self.start_handshake(*our_id, packet.sender_id).await;
        }
        Ok(())
    }

    /// Send a DELIVERY_ACK back through the Noise envelope
    async fn send_delivery_ack(&self, peer: PeerId, message_id: &str) {
        let ack = DeliveryAck {
            message_id: message_id.to_string(),
            recipient_nickname: self.host.nickname(),
            timestamp: now_millis(),
        };
        let Ok(body) = ack.encode() else { return };
        let mut plaintext = Vec::with_capacity(1 + body.len());
        plaintext.push(MESSAGE_TYPE_DELIVERY_ACK);
        plaintext.extend_from_slice(&body);

        let our_id = self.local_peer_id().await;
        let outbound = self.outbound_tx.clone();
        let result = self
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
        if let Err(e) = result {
            log::debug!("delivery ack to {} skipped: {}", peer_id_to_hex(&peer), e);
        }
    }

    /// Send our ANNOUNCE toward one peer, once per record
    async fn send_announce_to(&self, peer: PeerId) {
        if !self.peers.mark_announced_to(&peer) {
            return;
        }
        let our_id = self.local_peer_id().await;
        self.send(BitchatPacket::new_direct(
            MESSAGE_TYPE_ANNOUNCE,
            our_id,
            peer,
            ANNOUNCE_TTL,
            self.host.nickname().into_bytes(),
        ));
    }

    /// Drain the store-and-forward queue toward a now-reachable peer,
    /// spacing sends so the link is not saturated
    async fn flush_cached(&self, peer: PeerId) {
        let pending = self.store.flush_for(&peer).await;
        if pending.is_empty() {
            return;
        }

        let security = self.security.clone();
        let store = self.store.clone();
        let outbound = self.outbound_tx.clone();
        let identity = self.identity.clone();
        let spacing = self.flush_spacing;

        tokio::spawn(async move {
            let our_id = identity.read().await.peer_id;
            let mut remaining = pending.into_iter();
            while let Some(stored) = remaining.next() {
                let Ok(inner_bytes) = BinaryProtocol::encode(&stored.packet) else {
                    continue;
                };
                let sent = security
                    .encrypt_for_with(peer, &inner_bytes, |ciphertext| {
                        let _ = outbound.send(RoutedPacket::local(BitchatPacket::new_direct(
                            MESSAGE_TYPE_NOISE_ENCRYPTED,
                            our_id,
                            peer,
                            MAX_TTL,
                            ciphertext,
                        )));
                    })
                    .await;
                match sent {
                    Ok(()) => tokio::time::sleep(spacing).await,
                    Err(_) => {
                        // Session went away mid-flush; put the rest back
                        let mut requeue = vec![stored];
                        requeue.extend(remaining);
                        store.requeue(&peer, requeue).await;
                        return;
                    }
                }
            }
        });
    }

    /// Relay a packet not addressed to us, with jitter
    async fn maybe_relay(&self, routed: &RoutedPacket) {
        let our_id = self.local_peer_id().await;
        let decision = self
            .relay
            .decide(&routed.packet, &our_id, self.peers.active_count());

        if let RelayDecision::Relay(packet, delay) = decision {
            self.stats.write().await.messages_relayed += 1;
            let outbound = self.outbound_tx.clone();
            let relay_peer = routed.relay_peer;
            let relay_address = routed.relay_address.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = outbound.send(RoutedPacket {
                    packet,
                    relay_peer,
                    relay_address,
                });
            });
        }
    }
}
