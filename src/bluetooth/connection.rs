//! Connection Manager
//!
//! Owns the live-connection map. Each address is Disconnected, Connecting
//! (dial in flight) or Connected (link up with a writer task). Only
//! Connected entries are sendable; the peer directory's connected flag is a
//! projection of this table maintained by the node.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::radio::{PeerAddress, Radio};

/// Connection state of one peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// An established outbound link
///
/// Frames queued on `outbox` are written by a dedicated task, so writes to
/// one peer land in submission order. Dropping the link aborts that task
/// along with any frames still queued for it.
struct Link {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    writer: JoinHandle<()>,
    established: Instant,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.writer.abort();
    }
}

enum Slot {
    Connecting { since: Instant },
    Connected(Link),
}

pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    dial_failures: mpsc::UnboundedSender<PeerAddress>,
    connection_timeout: Option<Duration>,
    slots: HashMap<PeerAddress, Slot>,
}

impl ConnectionManager {
    /// Failed or timed-out dials are reported on `dial_failures`
    pub fn new(
        radio: Arc<dyn Radio>,
        dial_failures: mpsc::UnboundedSender<PeerAddress>,
        connection_timeout: Option<Duration>,
    ) -> Self {
        Self {
            radio,
            dial_failures,
            connection_timeout,
            slots: HashMap::new(),
        }
    }

    pub fn state(&self, address: &PeerAddress) -> ConnectionState {
        match self.slots.get(address) {
            None => ConnectionState::Disconnected,
            Some(Slot::Connecting { .. }) => ConnectionState::Connecting,
            Some(Slot::Connected(_)) => ConnectionState::Connected,
        }
    }

    /// Open an outbound link; returns false if one exists or is in flight
    pub fn dial(&mut self, address: &PeerAddress) -> bool {
        if self.slots.contains_key(address) {
            debug!("Dial to {} skipped: {:?}", address, self.state(address));
            return false;
        }

        self.slots.insert(
            address.clone(),
            Slot::Connecting {
                since: Instant::now(),
            },
        );
        debug!("Dialing {}", address);

        let radio = self.radio.clone();
        let failures = self.dial_failures.clone();
        let timeout = self.connection_timeout;
        let address = address.clone();

        tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, radio.dial(&address)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Connection timeout for peer: {}", address);
                        // The abandoned dial may have left a half-open link.
                        if let Err(e) = radio.disconnect(&address).await {
                            debug!("Cleanup after timeout to {} failed: {}", address, e);
                        }
                        let _ = failures.send(address);
                        return;
                    }
                },
                None => radio.dial(&address).await,
            };

            if let Err(e) = result {
                warn!("Failed to connect to peer {}: {}", address, e);
                let _ = failures.send(address);
            }
        });

        true
    }

    /// A remote peer wrote our configuration descriptor
    ///
    /// Enable dials back a reciprocal link, disable closes it. Returns true
    /// if the connection table changed.
    pub fn on_subscription(&mut self, address: &PeerAddress, enabled: bool) -> bool {
        if enabled {
            debug!("Peer {} subscribed, dialing back", address);
            self.dial(address)
        } else {
            debug!("Peer {} unsubscribed", address);
            self.close(address)
        }
    }

    /// The radio confirmed an outbound link; returns true if newly connected
    pub fn on_link_up(&mut self, address: &PeerAddress) -> bool {
        if let Some(Slot::Connected(_)) = self.slots.get(address) {
            return false;
        }

        if let Some(Slot::Connecting { since }) = self.slots.get(address) {
            debug!("Link to {} up after {:?}", address, since.elapsed());
        }

        let link = self.open_link(address);
        self.slots.insert(address.clone(), Slot::Connected(link));
        info!("Connected to peer: {}", address);
        true
    }

    /// The link went away; returns true if the peer was connected
    pub fn on_link_down(&mut self, address: &PeerAddress) -> bool {
        match self.slots.remove(address) {
            Some(Slot::Connected(link)) => {
                info!(
                    "Disconnected from peer: {} (up {:?})",
                    address,
                    link.established.elapsed()
                );
                true
            }
            Some(Slot::Connecting { .. }) => {
                debug!("Link to {} dropped while dialing", address);
                false
            }
            None => false,
        }
    }

    /// A dial did not complete; returns true if the attempt was still pending
    pub fn on_dial_failed(&mut self, address: &PeerAddress) -> bool {
        match self.slots.get(address) {
            Some(Slot::Connecting { .. }) => {
                self.slots.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Locally close a link; returns true if the peer was connected
    pub fn close(&mut self, address: &PeerAddress) -> bool {
        let was_connected = match self.slots.remove(address) {
            Some(Slot::Connected(_)) => true,
            Some(Slot::Connecting { .. }) => false,
            None => return false,
        };

        let radio = self.radio.clone();
        let address = address.clone();
        tokio::spawn(async move {
            if let Err(e) = radio.disconnect(&address).await {
                warn!("Failed to disconnect from {}: {}", address, e);
            }
        });

        was_connected
    }

    /// Forget every link without talking to the radio; returns the connected ones
    pub fn close_all(&mut self) -> Vec<PeerAddress> {
        let connected = self.live_addresses().into_iter().collect();
        self.slots.clear();
        connected
    }

    /// Queue a frame on every live link; returns how many accepted it
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Connected(link) => Some(link),
                Slot::Connecting { .. } => None,
            })
            .filter(|link| link.outbox.send(frame.to_vec()).is_ok())
            .count()
    }

    pub fn live_addresses(&self) -> BTreeSet<PeerAddress> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Connected(_)))
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Connected(_)))
            .count()
    }

    pub fn get_statistics(&self) -> Value {
        let connections: Vec<Value> = self
            .slots
            .iter()
            .filter_map(|(address, slot)| match slot {
                Slot::Connected(link) => Some(serde_json::json!({
                    "address": address,
                    "connected_secs": link.established.elapsed().as_secs(),
                })),
                Slot::Connecting { .. } => None,
            })
            .collect();
        let dialing = self.slots.len() - connections.len();

        serde_json::json!({
            "active_connections": connections,
            "total_connections": connections.len(),
            "pending_dials": dialing,
        })
    }

    fn open_link(&self, address: &PeerAddress) -> Link {
        let (outbox, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();
        let radio = self.radio.clone();
        let target = address.clone();

        let writer = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match radio.write(&target, &frame).await {
                    Ok(()) => debug!("Sent {} bytes to {}", frame.len(), target),
                    Err(e) => warn!("Failed to send message to {}: {}", target, e),
                }
            }
        });

        Link {
            outbox,
            writer,
            established: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::Ether;
    use crate::bluetooth::radio::{AdvertisementData, RadioError, RadioEvent, RadioEvents};

    async fn next_frame(events: &mut RadioEvents) -> Vec<u8> {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
                Ok(Some(RadioEvent::FrameReceived { data, .. })) => return data,
                Ok(Some(_)) => continue,
                other => panic!("no frame received: {:?}", other.map(|e| e.is_some())),
            }
        }
    }

    fn manager(
        ether: &Ether,
        address: &str,
    ) -> (ConnectionManager, RadioEvents, mpsc::UnboundedReceiver<PeerAddress>) {
        let (radio, events) = ether.attach(address);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let manager =
            ConnectionManager::new(Arc::new(radio), failures_tx, Some(Duration::from_secs(1)));
        (manager, events, failures_rx)
    }

    /// Dials never complete; disconnects are recorded
    #[derive(Default)]
    struct StalledRadio {
        disconnected: parking_lot::Mutex<Vec<PeerAddress>>,
    }

    #[async_trait::async_trait]
    impl Radio for StalledRadio {
        async fn is_enabled(&self) -> bool {
            true
        }

        async fn start_advertising(&self, _: &AdvertisementData) -> Result<(), RadioError> {
            Ok(())
        }

        async fn stop_advertising(&self) -> Result<(), RadioError> {
            Ok(())
        }

        async fn start_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), RadioError> {
            Ok(())
        }

        async fn dial(&self, _: &PeerAddress) -> Result<(), RadioError> {
            std::future::pending().await
        }

        async fn disconnect(&self, address: &PeerAddress) -> Result<(), RadioError> {
            self.disconnected.lock().push(address.clone());
            Ok(())
        }

        async fn write(&self, _: &PeerAddress, _: &[u8]) -> Result<(), RadioError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn dial_moves_through_connecting_to_connected() {
        let ether = Ether::new();
        let (mut connections, mut events, _failures) = manager(&ether, "A");
        let (_b, _b_events) = ether.attach("B");
        let b = PeerAddress::from("B");

        assert!(connections.dial(&b));
        assert_eq!(connections.state(&b), ConnectionState::Connecting);
        assert!(!connections.dial(&b));

        match events.recv().await {
            Some(RadioEvent::LinkUp(address)) => assert!(connections.on_link_up(&address)),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(connections.state(&b), ConnectionState::Connected);
        assert!(!connections.on_link_up(&b));
        assert_eq!(connections.live_count(), 1);
    }

    #[tokio::test]
    async fn failed_dial_is_reported_and_cleared() {
        let ether = Ether::new();
        let (mut connections, _events, mut failures) = manager(&ether, "A");
        let ghost = PeerAddress::from("ghost");

        assert!(connections.dial(&ghost));
        let failed = failures.recv().await.unwrap();
        assert_eq!(failed, ghost);

        assert!(connections.on_dial_failed(&ghost));
        assert_eq!(connections.state(&ghost), ConnectionState::Disconnected);
        assert!(!connections.on_dial_failed(&ghost));
    }

    #[tokio::test]
    async fn writes_arrive_in_submission_order() {
        let ether = Ether::new();
        let (mut connections, _events, _failures) = manager(&ether, "A");
        let (_b, mut b_events) = ether.attach("B");
        let b = PeerAddress::from("B");

        assert!(connections.dial(&b));
        // Give the dial task a chance to run before the link is declared up.
        tokio::task::yield_now().await;
        while !ether.is_linked(&"A".into(), &b) {
            tokio::task::yield_now().await;
        }
        connections.on_link_up(&b);

        for i in 0..5u8 {
            assert_eq!(connections.broadcast(&[i]), 1);
        }
        for i in 0..5u8 {
            assert_eq!(next_frame(&mut b_events).await, vec![i]);
        }
    }

    #[tokio::test]
    async fn broadcast_skips_links_still_connecting() {
        let ether = Ether::new();
        let (mut connections, _events, _failures) = manager(&ether, "A");
        let b = PeerAddress::from("B");

        assert_eq!(connections.broadcast(b"frame"), 0);
        connections.dial(&b);
        assert_eq!(connections.state(&b), ConnectionState::Connecting);
        assert_eq!(connections.broadcast(b"frame"), 0);
    }

    #[tokio::test]
    async fn teardown_and_close() {
        let ether = Ether::new();
        let (mut connections, _events, _failures) = manager(&ether, "A");
        let b = PeerAddress::from("B");
        let c = PeerAddress::from("C");

        connections.on_link_up(&b);
        connections.on_link_up(&c);
        assert_eq!(
            connections.live_addresses().into_iter().collect::<Vec<_>>(),
            vec![b.clone(), c.clone()]
        );

        assert!(connections.on_link_down(&b));
        assert!(!connections.on_link_down(&b));
        assert!(connections.close(&c));
        assert!(!connections.close(&c));
        assert_eq!(connections.live_count(), 0);
    }

    #[tokio::test]
    async fn subscription_enable_dials_back_and_disable_closes() {
        let ether = Ether::new();
        let (mut connections, _events, _failures) = manager(&ether, "A");
        let (_b, _b_events) = ether.attach("B");
        let b = PeerAddress::from("B");

        assert!(connections.on_subscription(&b, true));
        assert_eq!(connections.state(&b), ConnectionState::Connecting);

        connections.on_link_up(&b);
        assert!(connections.on_subscription(&b, false));
        assert_eq!(connections.state(&b), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn timed_out_dial_releases_the_link() {
        let radio = Arc::new(StalledRadio::default());
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let mut connections =
            ConnectionManager::new(radio.clone(), failures_tx, Some(Duration::from_millis(50)));
        let b = PeerAddress::from("B");

        assert!(connections.dial(&b));
        let failed = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap();
        assert_eq!(failed, Some(b.clone()));
        assert_eq!(*radio.disconnected.lock(), vec![b.clone()]);

        assert!(connections.on_dial_failed(&b));
        assert_eq!(connections.state(&b), ConnectionState::Disconnected);
    }
}
