//! Peer Directory
//!
//! Discovered peers, one record per address, kept in descending signal
//! strength order. Records are never removed; the directory lives as long
//! as the node does.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::radio::PeerAddress;

/// Information about a discovered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub name: String,
    /// Received signal strength in dBm, higher is closer
    pub rssi: i16,
    /// Projection of the connection table, never set from discovery
    pub is_connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(address: PeerAddress, name: String, rssi: i16) -> Self {
        Self {
            address,
            name,
            rssi,
            is_connected: false,
            last_seen: Utc::now(),
        }
    }

    /// Convert RSSI to a 0.0..=1.0 proximity score (typical BLE range -100..-30 dBm)
    pub fn signal_quality(&self) -> f32 {
        ((self.rssi as f32 + 100.0) / 70.0).clamp(0.0, 1.0)
    }
}

/// How a sighting changed the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Updated,
}

/// Tracks discovered peers
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: Vec<PeerRecord>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a first sighting or refresh an existing record in place
    pub fn upsert(&mut self, address: PeerAddress, name: String, rssi: i16) -> Sighting {
        let sighting = match self.peers.iter_mut().find(|p| p.address == address) {
            Some(peer) => {
                peer.name = name;
                peer.rssi = rssi;
                peer.last_seen = Utc::now();
                debug!("Updated peer: {} ({}) rssi {}", peer.name, peer.address, rssi);
                Sighting::Updated
            }
            None => {
                info!("Discovered new peer: {} ({}) rssi {}", name, address, rssi);
                self.peers.push(PeerRecord::new(address, name, rssi));
                Sighting::New
            }
        };

        self.peers.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        sighting
    }

    /// Reflect a connection table change; returns true if a record changed
    pub fn set_connected(&mut self, address: &PeerAddress, connected: bool) -> bool {
        match self.peers.iter_mut().find(|p| &p.address == address) {
            Some(peer) if peer.is_connected != connected => {
                peer.is_connected = connected;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&PeerRecord> {
        self.peers.iter().find(|p| &p.address == address)
    }

    /// Get list of all peers, strongest signal first
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Get peer statistics
    pub fn get_statistics(&self) -> Value {
        let connected = self.peers.iter().filter(|p| p.is_connected).count();
        let strongest = self.peers.first().map(|p| p.rssi);

        serde_json::json!({
            "total_peers": self.peers.len(),
            "connected_peers": connected,
            "strongest_rssi": strongest,
        })
    }
}
