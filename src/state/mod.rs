//! Observable Node State
//!
//! What collaborators (a UI, a logger, persistence) can watch: latest-value
//! streams for the node's user-visible state, and a broadcast of discrete
//! mesh events.

pub mod flow;

pub use flow::StateFlow;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::bluetooth::peer_directory::PeerRecord;
use crate::bluetooth::radio::PeerAddress;
use crate::message::MeshMessage;

/// Discrete notifications for collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MeshEvent {
    MessageReceived(MeshMessage),
    PeerConnected(PeerAddress),
    PeerDisconnected(PeerAddress),
}

/// Latest-value streams published by a mesh node
#[derive(Debug, Clone)]
pub struct MeshState {
    pub scanning: StateFlow<bool>,
    pub peers: StateFlow<Vec<PeerRecord>>,
    pub connected: StateFlow<BTreeSet<PeerAddress>>,
    pub bluetooth_enabled: StateFlow<bool>,
    pub last_message: StateFlow<Option<MeshMessage>>,
}

impl MeshState {
    pub fn new() -> Self {
        Self {
            scanning: StateFlow::new(false),
            peers: StateFlow::new(Vec::new()),
            connected: StateFlow::new(BTreeSet::new()),
            bluetooth_enabled: StateFlow::new(false),
            last_message: StateFlow::new(None),
        }
    }

    /// Get current state as JSON
    pub fn get_current_state(&self) -> Value {
        serde_json::json!({
            "scanning": self.scanning.get(),
            "bluetooth_enabled": self.bluetooth_enabled.get(),
            "peers": self.peers.get(),
            "connected": self.connected.get(),
            "last_message": self.last_message.get(),
            "timestamp": chrono::Utc::now()
        })
    }
}

impl Default for MeshState {
    fn default() -> Self {
        Self::new()
    }
}
