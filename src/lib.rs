//! AnoGram mesh - infrastructure-free chat over Bluetooth LE
//!
//! Nodes advertise a GATT service, discover each other by name, hold
//! reciprocal links and flood text messages to every live link, relaying
//! each copy until its hop count reaches the limit.

pub mod bluetooth;
pub mod config;
pub mod message;
pub mod state;

pub use bluetooth::{Ether, MeshService, PeerAddress, Radio};
pub use config::MeshConfig;
pub use message::MeshMessage;
pub use state::{MeshEvent, MeshState};
