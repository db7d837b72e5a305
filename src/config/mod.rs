//! Configuration for the BitChat mesh core
//!
//! Protocol constants here are shared byte-for-byte with the iOS peer and
//! must not change. Tunables default to the values the protocol was
//! validated with; the power policy trades discovery latency for battery.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// BitChat GATT service UUID (protocol constant)
pub const BITCHAT_SERVICE_UUID: Uuid = Uuid::from_u128(0xF47B5E2D_4A9E_4C5A_9B3F_8E1D2C3A4B5C);

/// Single data characteristic: READ | WRITE | WRITE_NO_RESPONSE | NOTIFY
pub const BITCHAT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xA1B2C3D4_E5F6_4A5B_8C9D_0E1F2A3B4C5D);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// MTU requested after connect; data sent before the MTU callback may
/// silently truncate, so bring-up ordering is mandatory
pub const REQUESTED_MTU: usize = 517;

/// Delay granted to in-flight writes on shutdown
pub const CLEANUP_DELAY: Duration = Duration::from_millis(500);

/// Base delay for the pending-connection attempt window
pub const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Power policy for duty-cycled scanning and advertising
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerMode {
    /// Plugged in or foreground with full battery
    Performance,
    /// Default operating point
    Balanced,
    /// Battery below ~40%
    PowerSaver,
    /// Battery critical or backgrounded
    UltraLowPower,
}

impl Default for PowerMode {
    fn default() -> Self {
        Self::Balanced
    }
}

impl PowerMode {
    /// Cap on concurrent established connections
    pub fn max_connections(&self) -> usize {
        match self {
            Self::Performance => 20,
            Self::Balanced => 10,
            Self::PowerSaver => 5,
            Self::UltraLowPower => 2,
        }
    }

    /// Unsolicited scan results below this RSSI are dropped
    pub fn rssi_threshold(&self) -> i16 {
        match self {
            Self::Performance => -95,
            Self::Balanced => -85,
            Self::PowerSaver => -75,
            Self::UltraLowPower => -65,
        }
    }

    /// Active scan window and the pause that follows it
    pub fn scan_duty_cycle(&self) -> (Duration, Duration) {
        match self {
            Self::Performance => (Duration::from_secs(10), Duration::from_secs(0)),
            Self::Balanced => (Duration::from_secs(5), Duration::from_secs(5)),
            Self::PowerSaver => (Duration::from_secs(3), Duration::from_secs(12)),
            Self::UltraLowPower => (Duration::from_secs(2), Duration::from_secs(28)),
        }
    }

    /// Advertising interval in milliseconds
    pub fn advertising_interval_ms(&self) -> u16 {
        match self {
            Self::Performance => 100,
            Self::Balanced => 250,
            Self::PowerSaver => 500,
            Self::UltraLowPower => 1000,
        }
    }

    /// Transmit power level in dBm
    pub fn tx_power_level(&self) -> i8 {
        match self {
            Self::Performance => 4,
            Self::Balanced => 0,
            Self::PowerSaver => -8,
            Self::UltraLowPower => -16,
        }
    }
}

/// BLE transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleTransportConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub requested_mtu: usize,
    pub power_mode: PowerMode,
    /// Consecutive scan starts inside this window are coalesced
    pub scan_rate_limit: Duration,
    /// Backoff after the OS reports a scan rate-limit violation
    pub scan_backoff: Duration,
    /// Connection attempts per device allowed within `2 * retry_delay`
    pub max_connection_attempts: u32,
    pub connection_retry_delay: Duration,
    /// Pacing between back-to-back fragment writes (wire compatibility)
    pub fragment_pacing: Duration,
    pub cleanup_delay: Duration,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: BITCHAT_SERVICE_UUID,
            characteristic_uuid: BITCHAT_CHARACTERISTIC_UUID,
            requested_mtu: REQUESTED_MTU,
            power_mode: PowerMode::default(),
            scan_rate_limit: Duration::from_secs(5),
            scan_backoff: Duration::from_secs(10),
            max_connection_attempts: 3,
            connection_retry_delay: CONNECTION_RETRY_DELAY,
            fragment_pacing: Duration::from_millis(20),
            cleanup_delay: CLEANUP_DELAY,
        }
    }
}

/// Configuration for the mesh service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Where the persistent identity lives; `None` keeps keys in memory
    pub data_dir: Option<PathBuf>,
    /// Replay window: packets outside `now ± tolerance` are dropped
    pub timestamp_tolerance: Duration,
    /// Sliding dedup window; also the periodic reset cadence
    pub dedup_window: Duration,
    /// Peers unseen for this long are evicted
    pub stale_peer_timeout: Duration,
    /// Cadence of the eviction sweep
    pub sweep_interval: Duration,
    /// Cadence of periodic re-announcement
    pub announce_interval: Duration,
    /// Regular store-and-forward cache bound
    pub max_cached_messages: usize,
    /// Regular cache entry lifetime
    pub cached_message_ttl: Duration,
    /// Per-favorite store-and-forward cache bound
    pub max_cached_messages_per_favorite: usize,
    /// Spacing between sends when draining a cache to a peer
    pub flush_spacing: Duration,
    /// Relay jitter bounds
    pub relay_delay_min: Duration,
    pub relay_delay_max: Duration,
    pub transport: BleTransportConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            timestamp_tolerance: Duration::from_secs(300),
            dedup_window: Duration::from_secs(300),
            stale_peer_timeout: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
            announce_interval: Duration::from_secs(30),
            max_cached_messages: 100,
            cached_message_ttl: Duration::from_secs(12 * 3600),
            max_cached_messages_per_favorite: 1000,
            flush_spacing: Duration::from_millis(100),
            relay_delay_min: Duration::from_millis(50),
            relay_delay_max: Duration::from_millis(500),
            transport: BleTransportConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_modes_order_sanely() {
        assert!(PowerMode::Performance.max_connections() > PowerMode::UltraLowPower.max_connections());
        assert!(PowerMode::Performance.rssi_threshold() < PowerMode::UltraLowPower.rssi_threshold());
    }

    #[test]
    fn test_default_config_matches_protocol_constants() {
        let config = MeshConfig::default();
        assert_eq!(config.stale_peer_timeout, Duration::from_secs(180));
        assert_eq!(config.max_cached_messages, 100);
        assert_eq!(config.transport.requested_mtu, 517);
        assert_eq!(config.transport.fragment_pacing, Duration::from_millis(20));
    }
}
