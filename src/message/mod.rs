//! Message Handling Module
//!
//! Message records, the flood-relay policy and the store-and-forward queue.

pub mod message_types;
pub mod pending;
pub mod router;

pub use message_types::MeshMessage;
pub use pending::PendingQueue;
pub use router::{RelayEngine, RelayOutcome};
