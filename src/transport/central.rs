//! BLE central role: scanning and outbound GATT connections
//!
//! The trait isolates the connection manager from btleplug so the mesh
//! pipeline runs against in-memory links in tests and against platform
//! shims where btleplug is unavailable. Methods take `&self`; the event
//! stream is claimed once via [`BleCentral::take_events`] so the manager
//! can pump events without holding the command surface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Events emitted by the central role
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// Scan result for a device advertising the service UUID
    DeviceDiscovered { address: String, rssi: i16 },
    /// GATT connection established; bring-up not yet complete
    DeviceConnected { address: String },
    /// MTU negotiated and CCCD written; the link is usable
    DeviceReady { address: String, mtu: usize },
    /// Notification data arrived on the characteristic
    DataReceived { address: String, data: Vec<u8> },
    DeviceDisconnected { address: String, reason: String },
    /// Scan start failed; `rate_limited` selects the long backoff
    ScanFailed { rate_limited: bool },
}

/// The central half of the dual-role link layer
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Begin scanning, filtered by the service UUID
    async fn start_scanning(&self) -> Result<()>;

    async fn stop_scanning(&self) -> Result<()>;

    /// Initiate a GATT connection and run the bring-up sequence:
    /// request MTU, discover services, locate the characteristic, enable
    /// notifications. `DeviceReady` fires only after all four steps.
    async fn connect(&self, address: &str) -> Result<()>;

    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Write one frame to a ready device
    async fn write(&self, address: &str, data: &[u8]) -> Result<()>;

    /// Addresses of devices we initiated connections to
    fn connected_devices(&self) -> Vec<String>;

    /// Claim the event stream; yields `Some` exactly once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>>;
}

#[cfg(feature = "bluetooth")]
pub use btleplug_central::BtleplugCentral;

#[cfg(feature = "bluetooth")]
mod btleplug_central {
    use super::{BleCentral, CentralEvent};
    use crate::config::BleTransportConfig;
    use crate::error::{Error, Result};

    use async_trait::async_trait;
    use btleplug::api::{
        Central as _, CentralEvent as BtlCentralEvent, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    };
    use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
    use dashmap::DashMap;
    use futures::stream::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    /// btleplug-backed central implementation
    pub struct BtleplugCentral {
        config: BleTransportConfig,
        adapter: Adapter,
        /// Discovered peripherals, keyed by rendered id
        known: Arc<DashMap<String, PeripheralId>>,
        connected: Arc<DashMap<String, Peripheral>>,
        event_tx: mpsc::UnboundedSender<CentralEvent>,
        event_rx: Mutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
        scanning: AtomicBool,
    }

    impl BtleplugCentral {
        pub async fn new(config: BleTransportConfig) -> Result<Self> {
            let manager = Manager::new()
                .await
                .map_err(|e| Error::Platform(format!("bluetooth manager: {}", e)))?;
            let adapter = manager
                .adapters()
                .await
                .map_err(|e| Error::Platform(format!("bluetooth adapters: {}", e)))?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Platform("no bluetooth adapter available".to_string()))?;

            let (event_tx, event_rx) = mpsc::unbounded_channel();

            let central = Self {
                config,
                adapter,
                known: Arc::new(DashMap::new()),
                connected: Arc::new(DashMap::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
                scanning: AtomicBool::new(false),
            };
            central.spawn_adapter_event_pump().await?;
            Ok(central)
        }

        /// Forward adapter events into the trait's event model
        async fn spawn_adapter_event_pump(&self) -> Result<()> {
            let mut events = self
                .adapter
                .events()
                .await
                .map_err(|e| Error::Platform(format!("adapter events: {}", e)))?;
            let adapter = self.adapter.clone();
            let known = self.known.clone();
            let connected = self.connected.clone();
            let event_tx = self.event_tx.clone();
            let service_uuid = self.config.service_uuid;

            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        BtlCentralEvent::DeviceDiscovered(id)
                        | BtlCentralEvent::DeviceUpdated(id) => {
                            let address = id.to_string();
                            if connected.contains_key(&address) {
                                continue;
                            }
                            let Ok(peripheral) = adapter.peripheral(&id).await else {
                                continue;
                            };
                            let Ok(Some(properties)) = peripheral.properties().await else {
                                continue;
                            };
                            // The scan filter already narrows by service,
                            // but some stacks report everything.
                            if !properties.services.contains(&service_uuid) {
                                continue;
                            }
                            let rssi = properties.rssi.unwrap_or(i16::MIN);
                            known.insert(address.clone(), id);
                            let _ =
                                event_tx.send(CentralEvent::DeviceDiscovered { address, rssi });
                        }
                        BtlCentralEvent::DeviceDisconnected(id) => {
                            let address = id.to_string();
                            if connected.remove(&address).is_some() {
                                let _ = event_tx.send(CentralEvent::DeviceDisconnected {
                                    address,
                                    reason: "link lost".to_string(),
                                });
                            }
                        }
                        _ => {}
                    }
                }
            });
            Ok(())
        }

        fn find_characteristic(
            &self,
            peripheral: &Peripheral,
            address: &str,
        ) -> Result<btleplug::api::Characteristic> {
            peripheral
                .services()
                .iter()
                .filter(|s| s.uuid == self.config.service_uuid)
                .flat_map(|s| s.characteristics.iter().cloned())
                .find(|c| c.uuid == self.config.characteristic_uuid)
                .ok_or_else(|| Error::Transport(format!("characteristic not found on {}", address)))
        }

        /// Post-connect bring-up. Ordering is mandatory: data written before
        /// MTU negotiation may silently truncate.
        async fn bring_up(&self, address: &str, peripheral: &Peripheral) -> Result<usize> {
            // btleplug negotiates MTU implicitly on connect where the
            // platform allows; the configured request is the link budget.
            let mtu = self.config.requested_mtu;

            peripheral
                .discover_services()
                .await
                .map_err(|e| Error::Transport(format!("service discovery: {}", e)))?;

            let characteristic = self.find_characteristic(peripheral, address)?;

            // Writes the CCCD; notifications flow after this
            peripheral
                .subscribe(&characteristic)
                .await
                .map_err(|e| Error::Transport(format!("enable notifications: {}", e)))?;

            let mut notifications = peripheral
                .notifications()
                .await
                .map_err(|e| Error::Transport(format!("notification stream: {}", e)))?;
            let event_tx = self.event_tx.clone();
            let characteristic_uuid = self.config.characteristic_uuid;
            let notify_address = address.to_string();
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != characteristic_uuid {
                        continue;
                    }
                    if event_tx
                        .send(CentralEvent::DataReceived {
                            address: notify_address.clone(),
                            data: notification.value,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });

            Ok(mtu)
        }
    }

    #[async_trait]
    impl BleCentral for BtleplugCentral {
        async fn start_scanning(&self) -> Result<()> {
            if self.scanning.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let filter = ScanFilter {
                services: vec![self.config.service_uuid],
            };
            match self.adapter.start_scan(filter).await {
                Ok(()) => {
                    log::debug!("scan started");
                    Ok(())
                }
                Err(e) => {
                    self.scanning.store(false, Ordering::SeqCst);
                    let message = e.to_string();
                    let rate_limited = message.to_lowercase().contains("registration failed")
                        || message.to_lowercase().contains("too frequent");
                    let _ = self.event_tx.send(CentralEvent::ScanFailed { rate_limited });
                    Err(Error::Network(format!("scan start: {}", message)))
                }
            }
        }

        async fn stop_scanning(&self) -> Result<()> {
            if !self.scanning.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            self.adapter
                .stop_scan()
                .await
                .map_err(|e| Error::Network(format!("scan stop: {}", e)))
        }

        async fn connect(&self, address: &str) -> Result<()> {
            let id = self
                .known
                .get(address)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::UnknownPeer(address.to_string()))?;
            let peripheral = self
                .adapter
                .peripheral(&id)
                .await
                .map_err(|e| Error::Transport(format!("peripheral lookup: {}", e)))?;

            peripheral
                .connect()
                .await
                .map_err(|e| Error::Transport(format!("connect {}: {}", address, e)))?;
            let _ = self.event_tx.send(CentralEvent::DeviceConnected {
                address: address.to_string(),
            });

            let mtu = self.bring_up(address, &peripheral).await?;
            self.connected.insert(address.to_string(), peripheral);
            let _ = self.event_tx.send(CentralEvent::DeviceReady {
                address: address.to_string(),
                mtu,
            });
            Ok(())
        }

        async fn disconnect(&self, address: &str) -> Result<()> {
            if let Some((_, peripheral)) = self.connected.remove(address) {
                peripheral
                    .disconnect()
                    .await
                    .map_err(|e| Error::Transport(format!("disconnect {}: {}", address, e)))?;
            }
            Ok(())
        }

        async fn write(&self, address: &str, data: &[u8]) -> Result<()> {
            let peripheral = self
                .connected
                .get(address)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::UnknownPeer(address.to_string()))?;

            let characteristic = self.find_characteristic(&peripheral, address)?;

            peripheral
                .write(&characteristic, data, WriteType::WithoutResponse)
                .await
                .map_err(|e| Error::Transport(format!("write {}: {}", address, e)))
        }

        fn connected_devices(&self) -> Vec<String> {
            self.connected.iter().map(|e| e.key().clone()).collect()
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<CentralEvent>> {
            self.event_rx.lock().ok()?.take()
        }
    }
}
