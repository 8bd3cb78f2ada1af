//! Message Router
//!
//! Flood-relay policy: every accepted frame is delivered locally unless this
//! node originated it, then re-broadcast one hop further while the hop budget
//! allows. Forwarding goes to every live link, including the one the frame
//! arrived on.

use log::debug;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use super::message_types::MeshMessage;
use crate::bluetooth::protocol::MeshProtocol;

/// Message ids remembered when duplicate suppression is on
const SEEN_CACHE_SIZE: usize = 4096;

/// What to do with one received message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Message to hand to the local consumer
    pub deliver: Option<MeshMessage>,
    /// Next-hop copy to push over every live link
    pub forward: Option<MeshMessage>,
}

/// Counters exposed through node statistics
#[derive(Debug, Clone, Copy, Default)]
struct RelayStats {
    received: u64,
    delivered: u64,
    echoes: u64,
    relayed: u64,
    hop_limited: u64,
    malformed: u64,
    duplicates: u64,
}

/// Bounded FIFO set of message ids
#[derive(Debug)]
struct SeenCache {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record an id; returns false if it was already present
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }

        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }

        true
    }
}

/// Relay engine for hop-bounded flooding
#[derive(Debug)]
pub struct RelayEngine {
    local_id: String,
    max_hops: u32,
    seen: Option<SeenCache>,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(local_id: impl Into<String>, max_hops: u32, suppress_duplicates: bool) -> Self {
        Self {
            local_id: local_id.into(),
            max_hops,
            seen: suppress_duplicates.then(|| SeenCache::new(SEEN_CACHE_SIZE)),
            stats: RelayStats::default(),
        }
    }

    pub fn set_local_id(&mut self, local_id: impl Into<String>) {
        self.local_id = local_id.into();
    }

    /// Note a message this node originated so its echoes are recognised
    pub fn originate(&mut self, message: &MeshMessage) {
        if let Some(seen) = self.seen.as_mut() {
            seen.insert(&message.id);
        }
    }

    /// Decode and route a raw frame; `None` when the frame is malformed
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<RelayOutcome> {
        match MeshProtocol::decode(frame) {
            Some(message) => Some(self.handle_message(message)),
            None => {
                self.stats.malformed += 1;
                debug!("Dropping malformed frame ({} bytes)", frame.len());
                None
            }
        }
    }

    /// Route an already decoded message
    pub fn handle_message(&mut self, message: MeshMessage) -> RelayOutcome {
        self.stats.received += 1;

        if let Some(seen) = self.seen.as_mut() {
            if !seen.insert(&message.id) {
                self.stats.duplicates += 1;
                debug!("Message already processed: {}", message.id);
                return RelayOutcome::default();
            }
        }

        let forward = message.relayed(self.max_hops);
        match &forward {
            Some(next) => {
                self.stats.relayed += 1;
                debug!("Relaying {} at hop {}", next.id, next.hop_count);
            }
            None => {
                self.stats.hop_limited += 1;
                debug!("Hop limit reached for {} ({} hops)", message.id, message.hop_count);
            }
        }

        let deliver = if message.is_from(&self.local_id) {
            self.stats.echoes += 1;
            None
        } else {
            self.stats.delivered += 1;
            Some(message)
        };

        RelayOutcome { deliver, forward }
    }

    /// Get router statistics
    pub fn get_statistics(&self) -> Value {
        serde_json::json!({
            "received": self.stats.received,
            "delivered": self.stats.delivered,
            "echoes": self.stats.echoes,
            "relayed": self.stats.relayed,
            "hop_limited": self.stats.hop_limited,
            "malformed": self.stats.malformed,
            "duplicates": self.stats.duplicates,
            "max_hops": self.max_hops,
            "suppress_duplicates": self.seen.is_some(),
        })
    }
}
