//! Bluetooth LE Mesh Networking Module
//!
//! Radio abstraction, the BLE and loopback radios, and the mesh node built
//! on top of them: advertiser, scanner, peer directory and connection table.

pub mod advertiser;
pub mod central;
pub mod connection;
pub mod loopback;
pub mod mesh_service;
pub mod peer_directory;
#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod peripheral;
pub mod protocol;
pub mod radio;
pub mod scanner;

pub use central::BleRadio;
pub use connection::ConnectionState;
pub use loopback::{Ether, LoopbackRadio};
pub use mesh_service::MeshService;
pub use peer_directory::PeerRecord;
pub use protocol::MeshProtocol;
pub use radio::{PeerAddress, Radio, RadioError, RadioEvent};
