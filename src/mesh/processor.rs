//! Per-peer serialized packet intake
//!
//! Every decoded inbound packet enters here. Packets from one immediate
//! sender are processed strictly one at a time on that sender's lane;
//! lanes run concurrently with each other. This is the hard invariant of
//! the concurrency design: the Noise session machine and the replay
//! windows are only ever driven from a single lane per peer.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::handler::MessageHandler;
use super::peers::PeerManager;
use crate::error::ErrorSeverity;
use crate::protocol::{peer_id_to_hex, RoutedPacket};
use crate::session::SecurityManager;

/// Lane key: the immediate sender when bound, else the link address.
/// Locally re-injected packets ride the lane of the peer they came from.
fn lane_key(routed: &RoutedPacket) -> String {
    match &routed.relay_peer {
        Some(peer) => peer_id_to_hex(peer),
        None => routed
            .relay_address
            .clone()
            .unwrap_or_else(|| "local".to_string()),
    }
}

/// Serialized per-peer intake in front of the message handler
pub struct PacketProcessor {
    lanes: DashMap<String, mpsc::UnboundedSender<RoutedPacket>>,
    handler: Arc<MessageHandler>,
    security: Arc<SecurityManager>,
    peers: Arc<PeerManager>,
}

impl PacketProcessor {
    pub fn new(
        handler: Arc<MessageHandler>,
        security: Arc<SecurityManager>,
        peers: Arc<PeerManager>,
    ) -> Self {
        Self {
            lanes: DashMap::new(),
            handler,
            security,
            peers,
        }
    }

    /// Enqueue a packet on its sender's lane, creating the lane worker on
    /// first contact. Lanes are unbounded by design: BLE throughput is far
    /// below what would make a burst dangerous, and drops would be worse.
    pub fn submit(&self, routed: RoutedPacket) {
        let key = lane_key(&routed);

        let sender = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key.clone()))
            .clone();

        if sender.send(routed).is_err() {
            // Worker died (shutdown); forget the lane so a later packet
            // can recreate it
            self.lanes.remove(&key);
        }
    }

    fn spawn_lane(&self, key: String) -> mpsc::UnboundedSender<RoutedPacket> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RoutedPacket>();
        let handler = self.handler.clone();
        let security = self.security.clone();
        let peers = self.peers.clone();

        tokio::spawn(async move {
            log::debug!("lane {} started", key);
            while let Some(routed) = rx.recv().await {
                Self::process(&handler, &security, &peers, routed).await;
            }
            log::debug!("lane {} drained", key);
        });

        tx
    }

    /// The per-packet pipeline: validate, dispatch, update last-seen
    async fn process(
        handler: &MessageHandler,
        security: &SecurityManager,
        peers: &PeerManager,
        routed: RoutedPacket,
    ) {
        if let Err(e) = security.validate_packet(&routed.packet).await {
            log::debug!(
                "dropping packet from {}: {}",
                peer_id_to_hex(&routed.packet.sender_id),
                e
            );
            return;
        }

        let immediate_sender = routed.relay_peer;
        match handler.handle(routed).await {
            Ok(true) => {
                if let Some(peer) = immediate_sender {
                    peers.touch(&peer);
                }
            }
            Ok(false) => {
                // Unknown type: logged by the handler, no last-seen update
            }
            Err(e) => {
                // Security-critical drops (forged signatures, decrypt
                // failures) surface at warn; parse noise stays quiet
                if e.severity() >= ErrorSeverity::Critical {
                    log::warn!("handler dropped packet: {}", e);
                } else {
                    log::debug!("handler dropped packet: {}", e);
                }
            }
        }
    }

    /// Number of live lanes (diagnostics)
    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Tear down every lane; workers exit once their queues drain
    pub fn shutdown(&self) {
        self.lanes.clear();
    }
}
