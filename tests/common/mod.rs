//! In-memory link layer and host stubs for mesh integration tests
//!
//! Two nodes are joined by [`link`]: one side plays the central role, the
//! other the peripheral role, and frames cross over unbounded channels
//! instead of a radio. Everything above the transport traits is the real
//! production pipeline.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use bitchat::config::MeshConfig;
use bitchat::mesh::{HostInterface, MeshEvent, MeshService};
use bitchat::protocol::PeerId;
use bitchat::transport::{
    AdvertisingConfig, BleCentral, BlePeripheral, CentralEvent, ConnectionManager, PeripheralEvent,
};

/// Central half of the in-memory link layer
pub struct MemCentral {
    name: String,
    event_tx: mpsc::UnboundedSender<CentralEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
    /// peer device name -> sink into that device's peripheral events
    links: DashMap<String, mpsc::UnboundedSender<PeripheralEvent>>,
}

impl MemCentral {
    pub fn new(name: &str) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_string(),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            links: DashMap::new(),
        })
    }

    /// Deliver a raw frame as if some device at `from_address` wrote it
    pub fn inject_frame(&self, from_address: &str, data: Vec<u8>) {
        let _ = self.event_tx.send(CentralEvent::DataReceived {
            address: from_address.to_string(),
            data,
        });
    }
}

#[async_trait]
impl BleCentral for MemCentral {
    async fn start_scanning(&self) -> bitchat::Result<()> {
        Ok(())
    }
    async fn stop_scanning(&self) -> bitchat::Result<()> {
        Ok(())
    }
    async fn connect(&self, _address: &str) -> bitchat::Result<()> {
        Ok(())
    }
    async fn disconnect(&self, address: &str) -> bitchat::Result<()> {
        self.links.remove(address);
        Ok(())
    }
    async fn write(&self, address: &str, data: &[u8]) -> bitchat::Result<()> {
        let sink = self
            .links
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| bitchat::Error::Transport(format!("no link to {}", address)))?;
        let _ = sink.send(PeripheralEvent::DataReceived {
            address: self.name.clone(),
            data: data.to_vec(),
        });
        Ok(())
    }
    fn connected_devices(&self) -> Vec<String> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>> {
        self.event_rx.lock().ok()?.take()
    }
}

/// Peripheral half of the in-memory link layer
pub struct MemPeripheral {
    name: String,
    event_tx: mpsc::UnboundedSender<PeripheralEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<PeripheralEvent>>>,
    advertising: StdMutex<bool>,
    /// central device name -> sink into that device's central events
    links: DashMap<String, mpsc::UnboundedSender<CentralEvent>>,
}

impl MemPeripheral {
    pub fn new(name: &str) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_string(),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            advertising: StdMutex::new(false),
            links: DashMap::new(),
        })
    }
}

#[async_trait]
impl BlePeripheral for MemPeripheral {
    async fn start_advertising(&self, _config: &AdvertisingConfig) -> bitchat::Result<()> {
        *self.advertising.lock().unwrap() = true;
        Ok(())
    }
    async fn stop_advertising(&self) -> bitchat::Result<()> {
        *self.advertising.lock().unwrap() = false;
        Ok(())
    }
    fn is_advertising(&self) -> bool {
        *self.advertising.lock().unwrap()
    }
    async fn notify_central(&self, address: &str, data: &[u8]) -> bitchat::Result<()> {
        let sink = self
            .links
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| bitchat::Error::Transport(format!("no central {}", address)))?;
        let _ = sink.send(CentralEvent::DataReceived {
            address: self.name.clone(),
            data: data.to_vec(),
        });
        Ok(())
    }
    async fn disconnect_central(&self, address: &str) -> bitchat::Result<()> {
        self.links.remove(address);
        Ok(())
    }
    fn connected_centrals(&self) -> Vec<String> {
        self.links.iter().map(|e| e.key().clone()).collect()
    }
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        self.event_rx.lock().ok()?.take()
    }
}

/// Host stub with a configurable nickname and favorites set
pub struct TestHost {
    nickname: String,
    favorites: StdMutex<HashSet<PeerId>>,
}

impl TestHost {
    pub fn new(nickname: &str) -> Arc<Self> {
        Arc::new(Self {
            nickname: nickname.to_string(),
            favorites: StdMutex::new(HashSet::new()),
        })
    }

    pub fn set_favorite(&self, peer_id: PeerId) {
        self.favorites.lock().unwrap().insert(peer_id);
    }
}

impl HostInterface for TestHost {
    fn nickname(&self) -> String {
        self.nickname.clone()
    }
    fn is_favorite(&self, peer_id: &PeerId) -> bool {
        self.favorites.lock().unwrap().contains(peer_id)
    }
    fn decrypt_channel(&self, _ciphertext: &[u8], _channel: &str) -> Option<String> {
        None
    }
}

/// One mesh node riding the in-memory link layer
pub struct TestNode {
    pub name: String,
    pub service: Arc<MeshService>,
    pub central: Arc<MemCentral>,
    pub peripheral: Arc<MemPeripheral>,
    pub host: Arc<TestHost>,
}

pub async fn spawn_node(name: &str, nickname: &str) -> TestNode {
    let central = MemCentral::new(name);
    let peripheral = MemPeripheral::new(name);
    let host = TestHost::new(nickname);

    let config = MeshConfig::default();
    let connection = Arc::new(ConnectionManager::new(
        config.transport.clone(),
        central.clone(),
        peripheral.clone(),
    ));
    let service = Arc::new(MeshService::new(config, host.clone(), connection).unwrap());
    service.clone().start().await.unwrap();

    TestNode {
        name: name.to_string(),
        service,
        central,
        peripheral,
        host,
    }
}

/// Join two nodes: `a` connects as central to `b`'s peripheral
pub async fn link(a: &TestNode, b: &TestNode) {
    a.central
        .links
        .insert(b.name.clone(), b.peripheral.event_tx.clone());
    b.peripheral
        .links
        .insert(a.name.clone(), a.central.event_tx.clone());

    let _ = a.central.event_tx.send(CentralEvent::DeviceConnected {
        address: b.name.clone(),
    });
    let _ = a.central.event_tx.send(CentralEvent::DeviceReady {
        address: b.name.clone(),
        mtu: 517,
    });
    let _ = b.peripheral.event_tx.send(PeripheralEvent::CentralSubscribed {
        address: a.name.clone(),
    });

    // Let the link-up presence exchange settle
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Tear a link down from both sides
pub async fn unlink(a: &TestNode, b: &TestNode) {
    a.central.links.remove(&b.name);
    b.peripheral.links.remove(&a.name);
    let _ = a.central.event_tx.send(CentralEvent::DeviceDisconnected {
        address: b.name.clone(),
        reason: "link dropped".to_string(),
    });
    let _ = b
        .peripheral
        .event_tx
        .send(PeripheralEvent::CentralDisconnected {
            address: a.name.clone(),
            reason: "link dropped".to_string(),
        });
}

/// Wait for an event matching the predicate, panicking on timeout
pub async fn expect_event<F>(
    rx: &mut broadcast::Receiver<MeshEvent>,
    timeout: Duration,
    what: &str,
    mut pred: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {}", what));
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if pred(&event) {
                    return event;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                panic!("event channel closed waiting for {}", what)
            }
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }
}

/// Assert no matching event arrives within the window
pub async fn expect_no_event<F>(
    rx: &mut broadcast::Receiver<MeshEvent>,
    window: Duration,
    what: &str,
    mut pred: F,
) where
    F: FnMut(&MeshEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = match deadline.checked_duration_since(tokio::time::Instant::now()) {
            Some(remaining) => remaining,
            None => return,
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if pred(&event) {
                    panic!("unexpected {}: {:?}", what, event);
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => return,
            Err(_) => return,
        }
    }
}

/// Poll an async condition until it holds or the timeout passes
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting until {}", what);
}
