//! Radio Abstraction
//!
//! The mesh node never talks to a Bluetooth stack directly. Link operations
//! go through [`Radio`], and everything the stack reports (advertisements,
//! link changes, subscription changes, incoming frames, read requests)
//! comes back as a [`RadioEvent`] on a single channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Stable identifier of a remote node (radio MAC on real hardware)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for PeerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// Connectable advertisement payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub service_uuid: Uuid,
    pub local_name: String,
    pub connectable: bool,
    pub interval: Duration,
}

/// One advertisement heard while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub address: PeerAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<Uuid>,
}

/// Everything the radio stack reports back to the node
#[derive(Debug)]
pub enum RadioEvent {
    /// Adapter powered on or off
    AdapterStateChanged { enabled: bool },
    /// Advertisement received during a scan
    Discovered(ScanReport),
    /// The scan stopped on its own
    ScanFailed { reason: String },
    /// Outbound link established and the message channel is usable
    LinkUp(PeerAddress),
    /// Link torn down by the remote side or the stack
    LinkDown(PeerAddress),
    /// Remote wrote enable/disable to the message channel's configuration descriptor
    SubscriptionChanged { address: PeerAddress, enabled: bool },
    /// Frame written to our message channel or notified by a remote one
    FrameReceived { address: PeerAddress, data: Vec<u8> },
    /// Remote read of one of our characteristics; `None` means read not permitted
    ReadRequest {
        address: PeerAddress,
        characteristic: Uuid,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
}

/// Receiving side of a radio's event channel
pub type RadioEvents = mpsc::UnboundedReceiver<RadioEvent>;

/// Sending side of a radio's event channel
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("Bluetooth radio unavailable")]
    Unavailable,

    #[error("Unsupported radio role: {0}")]
    Unsupported(&'static str),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerAddress),

    #[error("Not connected to {0}")]
    NotConnected(PeerAddress),

    #[error("Link operation failed: {0}")]
    Link(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

/// Link-level operations of a dual-role BLE radio
///
/// Calls return once the operation has been handed to the stack. Outcomes
/// that the stack reports asynchronously (a dial completing, a remote
/// teardown) arrive later as [`RadioEvent`]s.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Whether the adapter is present and powered
    async fn is_enabled(&self) -> bool;

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError>;

    async fn stop_advertising(&self) -> Result<(), RadioError>;

    async fn start_scan(&self) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    /// Open an outbound link; success is reported with [`RadioEvent::LinkUp`]
    async fn dial(&self, address: &PeerAddress) -> Result<(), RadioError>;

    /// Close an outbound link
    async fn disconnect(&self, address: &PeerAddress) -> Result<(), RadioError>;

    /// Write one frame to the remote message channel
    async fn write(&self, address: &PeerAddress, frame: &[u8]) -> Result<(), RadioError>;
}
