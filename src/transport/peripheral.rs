//! BLE peripheral role: advertising and the GATT server
//!
//! btleplug only provides the central role on most platforms, so the
//! peripheral side sits behind a trait with platform-specific
//! implementations supplied by the embedding application (Android and iOS
//! shims). Platforms without a peripheral API run central-only: peers must
//! connect inbound to full-duplex nodes, and the noop implementation still
//! reports the configured service UUID so ports can surface it.
//!
//! Methods take `&self`; the event stream is claimed once via
//! [`BlePeripheral::take_events`], mirroring the central trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{PowerMode, BITCHAT_SERVICE_UUID};
use crate::error::Result;

/// BLE advertising configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertisingConfig {
    /// Service UUID to advertise. The peer ID is deliberately NOT included
    /// in advertisements; identity is disclosed only after Noise completes.
    pub service_uuid: Uuid,
    /// Advertising interval in milliseconds
    pub advertising_interval_ms: u16,
    /// Transmit power level (-127 to +20 dBm)
    pub tx_power_level: i8,
    /// Whether to make the device connectable
    pub connectable: bool,
    /// Maximum number of simultaneous inbound connections
    pub max_connections: u8,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        Self::for_power_mode(PowerMode::default())
    }
}

impl AdvertisingConfig {
    /// Derive advertising parameters from the power policy
    pub fn for_power_mode(mode: PowerMode) -> Self {
        Self {
            service_uuid: BITCHAT_SERVICE_UUID,
            advertising_interval_ms: mode.advertising_interval_ms(),
            tx_power_level: mode.tx_power_level(),
            connectable: true,
            max_connections: mode.max_connections() as u8,
        }
    }
}

/// Events emitted by the peripheral role
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    AdvertisingStarted,
    AdvertisingStopped,
    /// A central wrote our CCCD and can now receive notifications
    CentralSubscribed { address: String },
    CentralDisconnected { address: String, reason: String },
    /// A central wrote data to the characteristic
    DataReceived { address: String, data: Vec<u8> },
    /// Recoverable advertising failure
    AdvertisingFailed { error: String, retry_after: Duration },
}

/// The peripheral half of the dual-role link layer
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    /// Start advertising with the given configuration
    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<()>;

    /// Stop advertising
    async fn stop_advertising(&self) -> Result<()>;

    fn is_advertising(&self) -> bool;

    /// Notify a subscribed central with a frame
    async fn notify_central(&self, address: &str, data: &[u8]) -> Result<()>;

    /// Drop one inbound connection
    async fn disconnect_central(&self, address: &str) -> Result<()>;

    /// Addresses of currently subscribed centrals
    fn connected_centrals(&self) -> Vec<String>;

    /// Claim the event stream; yields `Some` exactly once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>>;
}

/// Peripheral stand-in for central-only platforms. Never produces
/// connections; advertising state is tracked so callers can still surface
/// the service UUID through whatever side channel the platform offers.
pub struct NoopPeripheral {
    advertising: AtomicBool,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PeripheralEvent>>>,
    // Keeping the sender alive keeps the receiver open and silent
    _event_tx: mpsc::UnboundedSender<PeripheralEvent>,
}

impl NoopPeripheral {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            advertising: AtomicBool::new(false),
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            _event_tx: event_tx,
        }
    }
}

impl Default for NoopPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlePeripheral for NoopPeripheral {
    async fn start_advertising(&self, config: &AdvertisingConfig) -> Result<()> {
        log::info!(
            "peripheral role unavailable on this platform; central-only mode (service {})",
            config.service_uuid
        );
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    async fn notify_central(&self, address: &str, _data: &[u8]) -> Result<()> {
        Err(crate::error::Error::Transport(format!(
            "no peripheral link to {}",
            address
        )))
    }

    async fn disconnect_central(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    fn connected_centrals(&self) -> Vec<String> {
        Vec::new()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeripheralEvent>> {
        self.event_rx.lock().ok()?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_peripheral_tracks_advertising_state() {
        let peripheral = NoopPeripheral::new();
        assert!(!peripheral.is_advertising());
        peripheral
            .start_advertising(&AdvertisingConfig::default())
            .await
            .unwrap();
        assert!(peripheral.is_advertising());
        peripheral.stop_advertising().await.unwrap();
        assert!(!peripheral.is_advertising());
    }

    #[tokio::test]
    async fn test_noop_peripheral_events_claimed_once() {
        let peripheral = NoopPeripheral::new();
        assert!(peripheral.take_events().is_some());
        assert!(peripheral.take_events().is_none());
    }

    #[test]
    fn test_advertising_config_follows_power_mode() {
        let perf = AdvertisingConfig::for_power_mode(PowerMode::Performance);
        let ulp = AdvertisingConfig::for_power_mode(PowerMode::UltraLowPower);
        assert!(perf.advertising_interval_ms < ulp.advertising_interval_ms);
        assert!(perf.max_connections > ulp.max_connections);
        assert_eq!(perf.service_uuid, BITCHAT_SERVICE_UUID);
    }
}
