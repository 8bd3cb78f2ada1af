//! Pending Message Queue
//!
//! Store-and-forward buffer for messages produced while no link is live.
//! Entries leave the queue as soon as a send is attempted; nothing here
//! tracks whether a remote peer actually received them.

use log::debug;
use std::collections::VecDeque;

use super::message_types::MeshMessage;

/// Default upper bound on buffered messages
pub const DEFAULT_PENDING_CAPACITY: usize = 1000;

/// Outgoing messages awaiting a transport, oldest first
#[derive(Debug)]
pub struct PendingQueue {
    messages: VecDeque<MeshMessage>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a message; returns false if its id is already queued
    pub fn push(&mut self, message: MeshMessage) -> bool {
        if self.contains(&message.id) {
            debug!("Message already pending: {}", message.id);
            return false;
        }

        self.messages.push_back(message);

        while self.messages.len() > self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                debug!("Evicted pending message due to size limit: {}", evicted.id);
            }
        }

        true
    }

    /// Take every queued message for a send attempt
    pub fn drain(&mut self) -> Vec<MeshMessage> {
        self.messages.drain(..).collect()
    }

    /// Drop a message by id; returns true if it was queued
    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        before != self.messages.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn snapshot(&self) -> Vec<MeshMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}
