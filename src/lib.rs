//! BitChat - a decentralized, peer-to-peer chat mesh over Bluetooth LE
//!
//! Every node is simultaneously a BLE peripheral (advertising the service)
//! and a BLE central (scanning and connecting to peers). Messages flood
//! hop-by-hop under a TTL budget; private messages ride end-to-end Noise
//! sessions; offline recipients are served from a store-and-forward cache.
//!
//! The [`mesh::MeshService`] is the host-facing entry point; the radio is
//! abstracted behind the traits in [`transport`], with a btleplug central
//! behind the `bluetooth` feature.

pub mod config;
pub mod crypto;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::MeshConfig;
pub use error::{Error, Result};
pub use mesh::{HostInterface, MeshEvent, MeshService};
pub use protocol::{BitchatPacket, PeerId};
