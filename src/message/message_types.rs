//! Message Type Definitions
//!
//! Defines the chat message record carried across the mesh.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chat message as exchanged between mesh nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Globally unique id assigned by the originator
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// Creation time in milliseconds since the Unix epoch; never reassigned on relay
    pub timestamp: i64,
    /// Relay steps taken since origination
    pub hop_count: u32,
    /// False at origin, true after any relay step
    pub is_relayed: bool,
    /// Local bookkeeping only, never transmitted
    pub is_delivered: bool,
}

impl MeshMessage {
    /// Create a new originated message
    pub fn new(
        sender_id: impl Into<String>,
        sender_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
            hop_count: 0,
            is_relayed: false,
            is_delivered: false,
        }
    }

    /// Whether another relay step is allowed under `max_hops`
    pub fn can_relay(&self, max_hops: u32) -> bool {
        self.hop_count < max_hops
    }

    /// Copy for the next relay step, or `None` once the hop budget is spent
    pub fn relayed(&self, max_hops: u32) -> Option<Self> {
        if !self.can_relay(max_hops) {
            return None;
        }

        Some(Self {
            hop_count: self.hop_count + 1,
            is_relayed: true,
            is_delivered: false,
            ..self.clone()
        })
    }

    /// Check whether this node originated the message
    pub fn is_from(&self, node_id: &str) -> bool {
        self.sender_id == node_id
    }

    /// Get display name for sender
    pub fn get_sender_display_name(&self) -> &str {
        if self.sender_name.is_empty() {
            "Anonymous"
        } else {
            &self.sender_name
        }
    }

    /// Generate a short summary of the message
    pub fn get_summary(&self, max_chars: usize) -> String {
        if self.content.chars().count() <= max_chars {
            self.content.clone()
        } else {
            let kept: String = self.content.chars().take(max_chars.saturating_sub(3)).collect();
            format!("{}...", kept)
        }
    }
}
