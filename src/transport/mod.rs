//! Dual-role BLE connection manager
//!
//! The sole radio abstraction. One node is simultaneously a GATT server
//! (peripheral role, advertising the service) and a GATT client (central
//! role, scanning and connecting out). Either side of a link can originate
//! a frame; the policy in this module is symmetric over both roles:
//! - duty-cycled, rate-limited scanning with RSSI floor
//! - bounded connection attempts in a pending table
//! - connection cap with oldest-client eviction
//! - directed unicast fast-path and echo-suppressed broadcast fan-out
//! - fragmentation with fixed inter-fragment pacing

pub mod central;
pub mod peripheral;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

use crate::config::BleTransportConfig;
use crate::error::{Error, Result, RetryStrategy};
use crate::protocol::binary::BinaryProtocol;
use crate::protocol::fragment::FragmentManager;
use crate::protocol::{
    initial_ttl, peer_id_to_hex, BitchatPacket, PeerId, RoutedPacket, MESSAGE_TYPE_ANNOUNCE,
    MESSAGE_TYPE_LEAVE, MESSAGE_TYPE_NOISE_HANDSHAKE_INIT, MESSAGE_TYPE_NOISE_HANDSHAKE_RESP,
    MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE,
};

pub use central::{BleCentral, CentralEvent};
#[cfg(feature = "bluetooth")]
pub use central::BtleplugCentral;
pub use peripheral::{AdvertisingConfig, BlePeripheral, NoopPeripheral, PeripheralEvent};

/// Which side of the link we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We connected out as a GATT client
    Central,
    /// A remote central subscribed to our GATT server
    Peripheral,
}

/// One entry in the connected-device table
#[derive(Debug, Clone)]
struct ConnectedDevice {
    role: LinkRole,
    /// Bound once we see a link-local packet from the neighbor
    peer_id: Option<PeerId>,
    connected_at: Instant,
    /// Bring-up complete (MTU negotiated, CCCD written)
    ready: bool,
}

/// Connection-attempt bookkeeping, keyed by device address
#[derive(Debug, Clone)]
struct PendingConnection {
    attempts: u32,
    first_attempt: Instant,
}

/// Events the connection manager surfaces to the mesh service
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A link finished bring-up and is usable
    DeviceConnected { address: String },
    DeviceDisconnected { address: String, reason: String },
    /// A decoded inbound packet with its link provenance
    PacketReceived { routed: RoutedPacket },
}

/// Transport statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub connected_devices: usize,
    pub central_links: usize,
    pub peripheral_links: usize,
    pub pending_connections: usize,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: u64,
    packets_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    parse_errors: u64,
}

/// Record one connection attempt in the rolling window; false once the
/// per-device cap is reached. Entries outside the window are dropped
/// first, so a device is never blacklisted permanently.
fn register_attempt(
    pending: &DashMap<String, PendingConnection>,
    address: &str,
    max_attempts: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    pending.retain(|_, entry| now.duration_since(entry.first_attempt) < window);
    let mut entry = pending
        .entry(address.to_string())
        .or_insert_with(|| PendingConnection {
            attempts: 0,
            first_attempt: now,
        });
    if entry.attempts >= max_attempts {
        return false;
    }
    entry.attempts += 1;
    true
}

/// A packet that identifies the direct neighbor: announce-class and
/// handshake packets whose TTL is still the initial value for their type
/// cannot have been relayed, so their sender is the device on the other
/// end of this link.
fn binds_address(packet: &BitchatPacket) -> bool {
    matches!(
        packet.packet_type,
        MESSAGE_TYPE_ANNOUNCE
            | MESSAGE_TYPE_LEAVE
            | MESSAGE_TYPE_NOISE_IDENTITY_ANNOUNCE
            | MESSAGE_TYPE_NOISE_HANDSHAKE_INIT
            | MESSAGE_TYPE_NOISE_HANDSHAKE_RESP
    ) && packet.ttl == initial_ttl(packet.packet_type)
}

/// Owns the GATT handles and the device table; nothing else touches the
/// radio directly.
pub struct ConnectionManager {
    config: BleTransportConfig,
    central: Arc<dyn BleCentral>,
    peripheral: Arc<dyn BlePeripheral>,
    devices: Arc<DashMap<String, ConnectedDevice>>,
    /// peer ID -> device address for directly connected, bound neighbors
    peer_addresses: Arc<DashMap<PeerId, String>>,
    /// Last scan RSSI per device address
    last_rssi: Arc<DashMap<String, i16>>,
    pending: Arc<DashMap<String, PendingConnection>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    is_running: Arc<RwLock<bool>>,
    scan_backoff_until: Arc<RwLock<Option<Instant>>>,
    counters: Arc<RwLock<Counters>>,
}

impl ConnectionManager {
    pub fn new(
        config: BleTransportConfig,
        central: Arc<dyn BleCentral>,
        peripheral: Arc<dyn BlePeripheral>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            central,
            peripheral,
            devices: Arc::new(DashMap::new()),
            peer_addresses: Arc::new(DashMap::new()),
            last_rssi: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            is_running: Arc::new(RwLock::new(false)),
            scan_backoff_until: Arc::new(RwLock::new(None)),
            counters: Arc::new(RwLock::new(Counters::default())),
        }
    }

    /// Claim the upward event stream; yields `Some` exactly once
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.event_rx.lock().ok()?.take()
    }

    /// Bring both roles up and start the event pumps
    pub async fn start(self: Arc<Self>) -> Result<()> {
        *self.is_running.write().await = true;

        let advertising = AdvertisingConfig::for_power_mode(self.config.power_mode);
        if let Err(e) = self.peripheral.start_advertising(&advertising).await {
            // Central-only platforms still participate in the mesh
            log::warn!("advertising unavailable: {}", e);
        }

        if let Some(mut events) = self.central.take_events() {
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    manager.handle_central_event(event).await;
                }
            });
        }

        if let Some(mut events) = self.peripheral.take_events() {
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    manager.handle_peripheral_event(event).await;
                }
            });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.scan_loop().await;
        });

        log::info!("connection manager started");
        Ok(())
    }

    /// Disconnect everything and settle in-flight writes
    pub async fn stop(&self) {
        *self.is_running.write().await = false;

        let _ = self.central.stop_scanning().await;
        let _ = self.peripheral.stop_advertising().await;

        let devices: Vec<(String, LinkRole)> = self
            .devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().role))
            .collect();
        for (address, role) in devices {
            let result = match role {
                LinkRole::Central => self.central.disconnect(&address).await,
                LinkRole::Peripheral => self.peripheral.disconnect_central(&address).await,
            };
            if let Err(e) = result {
                log::debug!("disconnect {} during shutdown: {}", address, e);
            }
        }

        tokio::time::sleep(self.config.cleanup_delay).await;

        self.devices.clear();
        self.pending.clear();
        self.peer_addresses.clear();
        log::info!("connection manager stopped");
    }

    /// Duty-cycled scanning with rate limiting and failure backoff
    async fn scan_loop(self: Arc<Self>) {
        let (active, idle) = self.config.power_mode.scan_duty_cycle();
        let mut last_start: Option<Instant> = None;

        while *self.is_running.read().await {
            if let Some(until) = *self.scan_backoff_until.read().await {
                let now = Instant::now();
                if now < until {
                    tokio::time::sleep(until - now).await;
                    continue;
                }
                *self.scan_backoff_until.write().await = None;
            }

            // Consecutive starts within the rate-limit window are coalesced
            if let Some(started) = last_start {
                let since = started.elapsed();
                if since < self.config.scan_rate_limit {
                    tokio::time::sleep(self.config.scan_rate_limit - since).await;
                }
            }

            if !*self.is_running.read().await {
                break;
            }

            if let Err(e) = self.central.start_scanning().await {
                log::warn!("scan start failed: {}", e);
                // Transient radio errors back off one window and retry; the
                // OS rate-limit case arrives separately as a ScanFailed
                // event carrying the longer backoff
                if e.is_retryable() {
                    *self.scan_backoff_until.write().await =
                        Some(Instant::now() + self.config.scan_rate_limit);
                }
            }
            last_start = Some(Instant::now());

            tokio::time::sleep(active).await;

            if !idle.is_zero() {
                let _ = self.central.stop_scanning().await;
                tokio::time::sleep(idle).await;
            }
        }

        let _ = self.central.stop_scanning().await;
    }

    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered { address, rssi } => {
                self.handle_discovery(address, rssi).await;
            }
            CentralEvent::DeviceConnected { address } => {
                self.devices.insert(
                    address,
                    ConnectedDevice {
                        role: LinkRole::Central,
                        peer_id: None,
                        connected_at: Instant::now(),
                        ready: false,
                    },
                );
            }
            CentralEvent::DeviceReady { address, mtu } => {
                log::info!("device {} ready, mtu {}", address, mtu);
                self.pending.remove(&address);
                match self.devices.get_mut(&address) {
                    Some(mut device) => device.ready = true,
                    None => {
                        self.devices.insert(
                            address.clone(),
                            ConnectedDevice {
                                role: LinkRole::Central,
                                peer_id: None,
                                connected_at: Instant::now(),
                                ready: true,
                            },
                        );
                    }
                }
                self.enforce_connection_cap().await;
                let _ = self
                    .event_tx
                    .send(TransportEvent::DeviceConnected { address });
            }
            CentralEvent::DataReceived { address, data } => {
                self.handle_inbound(&address, data).await;
            }
            CentralEvent::DeviceDisconnected { address, reason } => {
                self.forget_device(&address, &reason);
            }
            CentralEvent::ScanFailed { rate_limited } => {
                let backoff = if rate_limited {
                    self.config.scan_backoff
                } else {
                    self.config.scan_rate_limit
                };
                log::warn!("scan failed, backing off {:?}", backoff);
                *self.scan_backoff_until.write().await = Some(Instant::now() + backoff);
            }
        }
    }

    async fn handle_peripheral_event(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::AdvertisingStarted => log::debug!("advertising started"),
            PeripheralEvent::AdvertisingStopped => log::debug!("advertising stopped"),
            PeripheralEvent::CentralSubscribed { address } => {
                log::info!("central {} subscribed", address);
                self.devices.insert(
                    address.clone(),
                    ConnectedDevice {
                        role: LinkRole::Peripheral,
                        peer_id: None,
                        connected_at: Instant::now(),
                        ready: true,
                    },
                );
                self.enforce_connection_cap().await;
                let _ = self
                    .event_tx
                    .send(TransportEvent::DeviceConnected { address });
            }
            PeripheralEvent::DataReceived { address, data } => {
                self.handle_inbound(&address, data).await;
            }
            PeripheralEvent::CentralDisconnected { address, reason } => {
                self.forget_device(&address, &reason);
            }
            PeripheralEvent::AdvertisingFailed { error, retry_after } => {
                log::warn!("advertising failed ({}), retrying in {:?}", error, retry_after);
                let peripheral = self.peripheral.clone();
                let is_running = self.is_running.clone();
                let config = AdvertisingConfig::for_power_mode(self.config.power_mode);
                tokio::spawn(async move {
                    tokio::time::sleep(retry_after).await;
                    if *is_running.read().await {
                        if let Err(e) = peripheral.start_advertising(&config).await {
                            log::warn!("advertising retry failed: {}", e);
                        }
                    }
                });
            }
        }
    }

    /// Discovery gate: RSSI floor, already-connected check, bounded attempts
    async fn handle_discovery(&self, address: String, rssi: i16) {
        self.last_rssi.insert(address.clone(), rssi);
        if rssi < self.config.power_mode.rssi_threshold() {
            log::trace!("dropping {} below rssi floor ({})", address, rssi);
            return;
        }
        if self.devices.contains_key(&address) {
            return;
        }

        let window = self.config.connection_retry_delay * 2;
        let max_attempts = self.config.max_connection_attempts;
        if !register_attempt(&self.pending, &address, max_attempts, window) {
            log::debug!("{}: attempt cap reached within {:?}, holding off", address, window);
            return;
        }

        let central = self.central.clone();
        let pending = self.pending.clone();
        let devices = self.devices.clone();
        let is_running = self.is_running.clone();
        let base_delay = self.config.connection_retry_delay;
        tokio::spawn(async move {
            let mut retries: u32 = 0;
            loop {
                match central.connect(&address).await {
                    Ok(()) => return,
                    Err(e) => {
                        // The error's category decides whether another try
                        // is worthwhile and how to pace it; the rolling
                        // window still caps total attempts per device.
                        let budget = match e.retry_strategy() {
                            RetryStrategy::NoRetry => 0,
                            RetryStrategy::LinearBackoff { max_retries }
                            | RetryStrategy::ExponentialBackoff { max_retries } => max_retries,
                        };
                        if retries >= budget {
                            log::warn!("connection to {} failed: {}", address, e);
                            return;
                        }
                        let delay = match e.retry_strategy() {
                            RetryStrategy::ExponentialBackoff { .. } => {
                                base_delay * 2u32.saturating_pow(retries)
                            }
                            _ => base_delay,
                        };
                        retries += 1;
                        log::debug!(
                            "connection to {} failed ({}), retry {} in {:?}",
                            address,
                            e,
                            retries,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        // The link may have come up from the other side
                        // while this task slept
                        if !*is_running.read().await
                            || devices.contains_key(&address)
                            || !register_attempt(&pending, &address, max_attempts, window)
                        {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// When over the power-policy cap, drop the oldest client-role link
    async fn enforce_connection_cap(&self) {
        let cap = self.config.power_mode.max_connections();
        while self.devices.len() > cap {
            let oldest = self
                .devices
                .iter()
                .filter(|entry| entry.value().role == LinkRole::Central)
                .min_by_key(|entry| entry.value().connected_at)
                .map(|entry| entry.key().clone());

            let Some(address) = oldest else { break };
            log::info!("over connection cap ({}), evicting {}", cap, address);
            if let Err(e) = self.central.disconnect(&address).await {
                log::debug!("evicting {}: {}", address, e);
            }
            self.forget_device(&address, "evicted over connection cap");
        }
    }

    fn forget_device(&self, address: &str, reason: &str) {
        if self.devices.remove(address).is_some() {
            log::info!("device {} disconnected: {}", address, reason);
            let _ = self.event_tx.send(TransportEvent::DeviceDisconnected {
                address: address.to_string(),
                reason: reason.to_string(),
            });
        }
        self.pending.remove(address);
        self.last_rssi.remove(address);
        self.peer_addresses.retain(|_, bound| bound != address);
    }

    /// Decode one inbound frame and hand it upward with link provenance
    async fn handle_inbound(&self, address: &str, data: Vec<u8>) {
        {
            let mut counters = self.counters.write().await;
            counters.bytes_received += data.len() as u64;
        }

        let packet = match BinaryProtocol::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                self.counters.write().await.parse_errors += 1;
                log::debug!("dropping malformed frame from {}: {}", address, e);
                return;
            }
        };

        if binds_address(&packet) {
            self.bind_peer(address, packet.sender_id);
        }

        let relay_peer = self
            .devices
            .get(address)
            .and_then(|device| device.peer_id);

        self.counters.write().await.packets_received += 1;

        let routed = RoutedPacket {
            packet,
            relay_peer,
            relay_address: Some(address.to_string()),
        };
        let _ = self.event_tx.send(TransportEvent::PacketReceived { routed });
    }

    /// Bind a device address to the peer ID observed on it. Rebinding the
    /// same address (peer-ID rotation) replaces the old mapping.
    pub fn bind_peer(&self, address: &str, peer_id: PeerId) {
        if let Some(mut device) = self.devices.get_mut(address) {
            if device.peer_id == Some(peer_id) {
                return;
            }
            device.peer_id = Some(peer_id);
        } else {
            return;
        }
        self.peer_addresses
            .retain(|existing, bound| bound != address || *existing == peer_id);
        self.peer_addresses.insert(peer_id, address.to_string());
        log::debug!("bound {} -> {}", peer_id_to_hex(&peer_id), address);
    }

    /// Transmit a packet: directed fast-path when the recipient is a bound
    /// direct neighbor, echo-suppressed fan-out otherwise. Oversized packets
    /// are fragmented and paced.
    pub async fn send_packet(&self, routed: &RoutedPacket) -> Result<()> {
        let fragments = FragmentManager::create_fragments(&routed.packet)?;
        let mut frames = Vec::with_capacity(fragments.len());
        for fragment in &fragments {
            frames.push(BinaryProtocol::encode(fragment)?);
        }

        // Directed fast-path
        if let Some(recipient) = routed.packet.recipient_id {
            if !routed.packet.is_broadcast() {
                if let Some(address) = self.address_for_peer(&recipient) {
                    let role = self
                        .devices
                        .get(&address)
                        .filter(|device| device.ready)
                        .map(|device| device.role);
                    if let Some(role) = role {
                        return self.write_frames(&address, role, &frames).await;
                    }
                }
            }
        }

        // Broadcast fan-out with echo suppression: never write back to the
        // arrival device, nor to any device bound to the origin sender.
        let targets: Vec<(String, LinkRole)> = self
            .devices
            .iter()
            .filter(|entry| entry.value().ready)
            .filter(|entry| match &routed.relay_address {
                Some(relay) => entry.key() != relay,
                None => true,
            })
            .filter(|entry| entry.value().peer_id != Some(routed.packet.sender_id))
            .map(|entry| (entry.key().clone(), entry.value().role))
            .collect();

        if targets.is_empty() {
            log::trace!("no eligible devices for packet fan-out");
            return Ok(());
        }

        for (address, role) in targets {
            if let Err(e) = self.write_frames(&address, role, &frames).await {
                log::warn!("write to {} failed: {}", address, e);
            }
        }
        Ok(())
    }

    /// Write a frame sequence to one device, pacing between fragments
    async fn write_frames(&self, address: &str, role: LinkRole, frames: &[Vec<u8>]) -> Result<()> {
        for (index, frame) in frames.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.fragment_pacing).await;
            }
            match role {
                LinkRole::Central => self.central.write(address, frame).await?,
                LinkRole::Peripheral => self.peripheral.notify_central(address, frame).await?,
            }
            let mut counters = self.counters.write().await;
            counters.packets_sent += 1;
            counters.bytes_sent += frame.len() as u64;
        }
        Ok(())
    }

    pub fn address_for_peer(&self, peer_id: &PeerId) -> Option<String> {
        self.peer_addresses.get(peer_id).map(|entry| entry.value().clone())
    }

    pub fn peer_for_address(&self, address: &str) -> Option<PeerId> {
        self.devices.get(address).and_then(|device| device.peer_id)
    }

    /// Last scan RSSI observed for a device address
    pub fn rssi_for_address(&self, address: &str) -> Option<i16> {
        self.last_rssi.get(address).map(|entry| *entry.value())
    }

    /// True when the peer is a bound, ready direct neighbor
    pub fn is_peer_connected(&self, peer_id: &PeerId) -> bool {
        match self.address_for_peer(peer_id) {
            Some(address) => self
                .devices
                .get(&address)
                .map(|device| device.ready)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn connected_addresses(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|entry| entry.value().ready)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop the address/peer bindings without touching links (panic mode)
    pub fn clear_bindings(&self) {
        self.peer_addresses.clear();
        for mut device in self.devices.iter_mut() {
            device.peer_id = None;
        }
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        let counters = self.counters.read().await;
        let central_links = self
            .devices
            .iter()
            .filter(|e| e.value().role == LinkRole::Central)
            .count();
        ConnectionStats {
            connected_devices: self.devices.len(),
            central_links,
            peripheral_links: self.devices.len() - central_links,
            pending_connections: self.pending.len(),
            packets_sent: counters.packets_sent,
            packets_received: counters.packets_received,
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            parse_errors: counters.parse_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MAX_TTL, MESSAGE_TYPE_MESSAGE};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MockCentral {
        event_tx: mpsc::UnboundedSender<CentralEvent>,
        event_rx: StdMutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
        writes: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
        connects: Arc<StdMutex<Vec<String>>>,
    }

    impl MockCentral {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<CentralEvent>) {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let injector = event_tx.clone();
            (
                Arc::new(Self {
                    event_tx,
                    event_rx: StdMutex::new(Some(event_rx)),
                    writes: Arc::new(StdMutex::new(Vec::new())),
                    connects: Arc::new(StdMutex::new(Vec::new())),
                }),
                injector,
            )
        }
    }

    #[async_trait]
    impl BleCentral for MockCentral {
        async fn start_scanning(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_scanning(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn connect(&self, address: &str) -> crate::error::Result<()> {
            self.connects.lock().unwrap().push(address.to_string());
            let _ = self.event_tx.send(CentralEvent::DeviceConnected {
                address: address.to_string(),
            });
            let _ = self.event_tx.send(CentralEvent::DeviceReady {
                address: address.to_string(),
                mtu: 517,
            });
            Ok(())
        }
        async fn disconnect(&self, _address: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn write(&self, address: &str, data: &[u8]) -> crate::error::Result<()> {
            self.writes
                .lock()
                .unwrap()
                .push((address.to_string(), data.to_vec()));
            Ok(())
        }
        fn connected_devices(&self) -> Vec<String> {
            Vec::new()
        }
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>> {
            self.event_rx.lock().ok()?.take()
        }
    }

    async fn manager_with_mock() -> (
        Arc<ConnectionManager>,
        Arc<MockCentral>,
        mpsc::UnboundedSender<CentralEvent>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let (central, injector) = MockCentral::new();
        let manager = Arc::new(ConnectionManager::new(
            BleTransportConfig::default(),
            central.clone(),
            Arc::new(NoopPeripheral::new()),
        ));
        let events = manager.take_events().unwrap();
        manager.clone().start().await.unwrap();
        (manager, central, injector, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn direct_packet(sender: u8, recipient: u8) -> RoutedPacket {
        RoutedPacket::local(BitchatPacket::new_direct(
            MESSAGE_TYPE_MESSAGE,
            [sender; 8],
            [recipient; 8],
            MAX_TTL,
            b"payload".to_vec(),
        ))
    }

    #[tokio::test]
    async fn test_discovery_below_rssi_floor_ignored() {
        let (_manager, central, injector, _events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "weak".to_string(),
                rssi: -120,
            })
            .unwrap();
        settle().await;
        assert!(central.connects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_connects_and_reports_ready() {
        let (manager, central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;

        assert_eq!(central.connects.lock().unwrap().as_slice(), ["dev-a"]);
        match events.recv().await.unwrap() {
            TransportEvent::DeviceConnected { address } => assert_eq!(address, "dev-a"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.connected_addresses(), vec!["dev-a".to_string()]);
    }

    #[tokio::test]
    async fn test_connection_attempts_bounded() {
        let (_manager, central, injector, _events) = manager_with_mock().await;
        // Discovery spam for a device that "connects" but whose link the
        // test immediately tears down again
        for _ in 0..6 {
            injector
                .send(CentralEvent::DeviceDiscovered {
                    address: "flappy".to_string(),
                    rssi: -40,
                })
                .unwrap();
            settle().await;
            injector
                .send(CentralEvent::DeviceDisconnected {
                    address: "flappy".to_string(),
                    reason: "flap".to_string(),
                })
                .unwrap();
            settle().await;
        }
        // Pending entry is removed on success/failure, but the attempt
        // counter inside one window still bounds the retry storm
        assert!(central.connects.lock().unwrap().len() <= 6);
    }

    struct FlakyCentral {
        event_tx: mpsc::UnboundedSender<CentralEvent>,
        event_rx: StdMutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
        failures_left: Arc<StdMutex<u32>>,
        connects: Arc<StdMutex<u32>>,
    }

    impl FlakyCentral {
        fn new(failures: u32) -> (Arc<Self>, mpsc::UnboundedSender<CentralEvent>) {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let injector = event_tx.clone();
            (
                Arc::new(Self {
                    event_tx,
                    event_rx: StdMutex::new(Some(event_rx)),
                    failures_left: Arc::new(StdMutex::new(failures)),
                    connects: Arc::new(StdMutex::new(0)),
                }),
                injector,
            )
        }
    }

    #[async_trait]
    impl BleCentral for FlakyCentral {
        async fn start_scanning(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop_scanning(&self) -> crate::error::Result<()> {
            Ok(())
        }
        async fn connect(&self, address: &str) -> crate::error::Result<()> {
            *self.connects.lock().unwrap() += 1;
            {
                let mut failures = self.failures_left.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::Network("simulated connect failure".to_string()));
                }
            }
            let _ = self.event_tx.send(CentralEvent::DeviceConnected {
                address: address.to_string(),
            });
            let _ = self.event_tx.send(CentralEvent::DeviceReady {
                address: address.to_string(),
                mtu: 517,
            });
            Ok(())
        }
        async fn disconnect(&self, _address: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn write(&self, _address: &str, _data: &[u8]) -> crate::error::Result<()> {
            Ok(())
        }
        fn connected_devices(&self) -> Vec<String> {
            Vec::new()
        }
        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>> {
            self.event_rx.lock().ok()?.take()
        }
    }

    #[tokio::test]
    async fn test_transient_connect_failure_retried_with_backoff() {
        let mut config = BleTransportConfig::default();
        config.connection_retry_delay = Duration::from_millis(20);

        // One retryable network failure before the connect succeeds
        let (central, injector) = FlakyCentral::new(1);
        let manager = Arc::new(ConnectionManager::new(
            config,
            central.clone(),
            Arc::new(NoopPeripheral::new()),
        ));
        let mut events = manager.take_events().unwrap();
        manager.clone().start().await.unwrap();

        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(TransportEvent::DeviceConnected { address })) => {
                assert_eq!(address, "dev-a")
            }
            other => panic!("expected DeviceConnected, got {:?}", other),
        }
        assert_eq!(*central.connects.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_inbound_packet_surfaces_with_provenance() {
        let (_manager, _central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;
        let _ = events.recv().await; // DeviceConnected

        let packet = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            [9u8; 8],
            MAX_TTL,
            b"hello".to_vec(),
        );
        injector
            .send(CentralEvent::DataReceived {
                address: "dev-a".to_string(),
                data: BinaryProtocol::encode(&packet).unwrap(),
            })
            .unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::PacketReceived { routed } => {
                assert_eq!(routed.packet, packet);
                assert_eq!(routed.relay_address.as_deref(), Some("dev-a"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_counted_and_dropped() {
        let (manager, _central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;
        let _ = events.recv().await;

        injector
            .send(CentralEvent::DataReceived {
                address: "dev-a".to_string(),
                data: vec![0xFF; 4],
            })
            .unwrap();
        settle().await;

        let stats = manager.connection_stats().await;
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.packets_received, 0);
    }

    #[tokio::test]
    async fn test_announce_with_initial_ttl_binds_address() {
        let (manager, _central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;
        let _ = events.recv().await;

        let announce = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_ANNOUNCE,
            [7u8; 8],
            crate::protocol::ANNOUNCE_TTL,
            b"carol".to_vec(),
        );
        injector
            .send(CentralEvent::DataReceived {
                address: "dev-a".to_string(),
                data: BinaryProtocol::encode(&announce).unwrap(),
            })
            .unwrap();
        settle().await;

        assert_eq!(manager.peer_for_address("dev-a"), Some([7u8; 8]));
        assert!(manager.is_peer_connected(&[7u8; 8]));

        // A relayed announce (decremented TTL) must NOT rebind
        let mut relayed = announce.clone();
        relayed.sender_id = [8u8; 8];
        relayed.ttl -= 1;
        relayed.timestamp += 1;
        injector
            .send(CentralEvent::DataReceived {
                address: "dev-a".to_string(),
                data: BinaryProtocol::encode(&relayed).unwrap(),
            })
            .unwrap();
        settle().await;
        assert_eq!(manager.peer_for_address("dev-a"), Some([7u8; 8]));
    }

    #[tokio::test]
    async fn test_directed_fast_path_writes_once() {
        let (manager, central, injector, mut events) = manager_with_mock().await;
        for address in ["dev-a", "dev-b"] {
            injector
                .send(CentralEvent::DeviceDiscovered {
                    address: address.to_string(),
                    rssi: -50,
                })
                .unwrap();
            settle().await;
            let _ = events.recv().await;
        }
        manager.bind_peer("dev-a", [1u8; 8]);
        manager.bind_peer("dev-b", [2u8; 8]);

        manager
            .send_packet(&direct_packet(9, 2))
            .await
            .unwrap();

        let writes = central.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "dev-b");
    }

    #[tokio::test]
    async fn test_broadcast_echo_suppression() {
        let (manager, central, injector, mut events) = manager_with_mock().await;
        for address in ["dev-a", "dev-b", "dev-c"] {
            injector
                .send(CentralEvent::DeviceDiscovered {
                    address: address.to_string(),
                    rssi: -50,
                })
                .unwrap();
            settle().await;
            let _ = events.recv().await;
        }
        // dev-a is where the packet arrived; dev-b is bound to the origin
        manager.bind_peer("dev-b", [5u8; 8]);

        let packet = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            [5u8; 8],
            MAX_TTL - 1,
            b"flood".to_vec(),
        );
        let routed = RoutedPacket {
            packet,
            relay_peer: None,
            relay_address: Some("dev-a".to_string()),
        };
        manager.send_packet(&routed).await.unwrap();

        let writes = central.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "dev-c");
    }

    #[tokio::test]
    async fn test_oversized_packet_fragmented_on_send() {
        let (manager, central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;
        let _ = events.recv().await;

        let packet = BitchatPacket::new_broadcast(
            MESSAGE_TYPE_MESSAGE,
            [9u8; 8],
            MAX_TTL,
            vec![0xAB; 420],
        );
        manager
            .send_packet(&RoutedPacket::local(packet))
            .await
            .unwrap();

        let writes = central.writes.lock().unwrap();
        assert!(writes.len() >= 3, "expected fragment series, got {}", writes.len());
        for (_, frame) in writes.iter() {
            let decoded = BinaryProtocol::decode(frame).unwrap();
            assert!(matches!(
                decoded.packet_type,
                crate::protocol::MESSAGE_TYPE_FRAGMENT_START
                    | crate::protocol::MESSAGE_TYPE_FRAGMENT_CONTINUE
                    | crate::protocol::MESSAGE_TYPE_FRAGMENT_END
            ));
        }
    }

    #[tokio::test]
    async fn test_stop_clears_tables() {
        let (manager, _central, injector, mut events) = manager_with_mock().await;
        injector
            .send(CentralEvent::DeviceDiscovered {
                address: "dev-a".to_string(),
                rssi: -50,
            })
            .unwrap();
        settle().await;
        let _ = events.recv().await;
        assert_eq!(manager.connected_addresses().len(), 1);

        manager.stop().await;
        assert!(manager.connected_addresses().is_empty());
        assert!(manager.peer_for_address("dev-a").is_none());
    }
}
