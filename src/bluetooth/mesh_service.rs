//! Bluetooth LE Mesh Service
//!
//! One node of the flood-relay chat mesh. A single task (the node) owns the
//! peer directory, the connection table, the relay engine and the pending
//! queue. Radio events and commands from [`MeshService`] handles are
//! funneled into that task, so every table has exactly one writer.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::advertiser::Advertiser;
use super::connection::{ConnectionManager, ConnectionState};
use super::peer_directory::{PeerDirectory, PeerRecord, Sighting};
use super::protocol::{
    MeshProtocol, ADVERTISE_INTERVAL, IDENTITY, MAX_FRAME_LEN, MESSAGE_CHARACTERISTIC_UUID,
    PEER_INFO_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use super::radio::{PeerAddress, Radio, RadioEvent, RadioEvents};
use super::scanner::Scanner;
use crate::config::MeshConfig;
use crate::message::{MeshMessage, PendingQueue, RelayEngine};
use crate::state::{MeshEvent, MeshState};

/// Mesh events buffered per subscriber before it starts lagging
const EVENT_QUEUE_SIZE: usize = 256;

/// Requests from service handles to the node task
#[derive(Debug)]
enum NodeCommand {
    SendMessage {
        content: String,
        reply: oneshot::Sender<MeshMessage>,
    },
    StartScan,
    StopScan,
    SetDeviceInfo {
        device_id: String,
        device_name: String,
    },
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    QueueMessage(MeshMessage),
    MarkDelivered {
        message_id: String,
        reply: oneshot::Sender<bool>,
    },
    PendingMessages(oneshot::Sender<Vec<MeshMessage>>),
    ConnectionState {
        address: PeerAddress,
        reply: oneshot::Sender<ConnectionState>,
    },
    Status(oneshot::Sender<Value>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running mesh node
///
/// Cheap to clone. Every handle talks to the same node; the node stops when
/// [`MeshService::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct MeshService {
    commands: mpsc::UnboundedSender<NodeCommand>,
    events: broadcast::Sender<MeshEvent>,
    state: MeshState,
}

impl MeshService {
    /// Start a node on `radio`; must be called from within a tokio runtime
    pub fn spawn(config: MeshConfig, radio: Arc<dyn Radio>, radio_events: RadioEvents) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE_SIZE);
        let (dial_failures_tx, dial_failures_rx) = mpsc::unbounded_channel();
        let state = MeshState::new();

        info!(
            "Starting Bluetooth LE mesh node {} ({})",
            config.device_id, config.device_name
        );

        let node = MeshNode {
            advertiser: Advertiser::new(SERVICE_UUID, config.device_name.clone(), ADVERTISE_INTERVAL),
            scanner: Scanner::new(config.scan_filter, IDENTITY, SERVICE_UUID),
            directory: PeerDirectory::new(),
            connections: ConnectionManager::new(
                radio.clone(),
                dial_failures_tx,
                config.connection_timeout(),
            ),
            relay: RelayEngine::new(
                config.device_id.clone(),
                config.max_relay_hops,
                config.suppress_duplicates,
            ),
            pending: PendingQueue::new(config.pending_capacity),
            radio,
            config,
            state: state.clone(),
            events: events_tx.clone(),
            enabled: false,
            scan_deadline: None,
        };

        tokio::spawn(node.run(commands_rx, radio_events, dial_failures_rx));

        Self {
            commands: commands_tx,
            events: events_tx,
            state,
        }
    }

    /// Observable node state
    pub fn state(&self) -> &MeshState {
        &self.state
    }

    /// Subscribe to received messages and peer connection changes
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Send a message to the mesh
    ///
    /// With no live connection the message is queued and pushed when one
    /// comes up. Returns the message as created.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<MeshMessage> {
        let content = content.into();
        self.request(|reply| NodeCommand::SendMessage { content, reply })
            .await
    }

    pub fn start_scan(&self) {
        self.post(NodeCommand::StartScan);
    }

    pub fn stop_scan(&self) {
        self.post(NodeCommand::StopScan);
    }

    /// Change the sender id and display name; the advertisement follows
    pub fn set_device_info(&self, device_id: impl Into<String>, device_name: impl Into<String>) {
        self.post(NodeCommand::SetDeviceInfo {
            device_id: device_id.into(),
            device_name: device_name.into(),
        });
    }

    pub fn connect_peer(&self, address: impl Into<PeerAddress>) {
        self.post(NodeCommand::Connect(address.into()));
    }

    pub fn disconnect_peer(&self, address: impl Into<PeerAddress>) {
        self.post(NodeCommand::Disconnect(address.into()));
    }

    /// Put an already built message on the pending queue
    pub fn queue_message(&self, message: MeshMessage) {
        self.post(NodeCommand::QueueMessage(message));
    }

    /// Drop a message from the pending queue; returns true if it was there
    pub async fn mark_message_delivered(&self, message_id: impl Into<String>) -> Result<bool> {
        let message_id = message_id.into();
        self.request(|reply| NodeCommand::MarkDelivered { message_id, reply })
            .await
    }

    pub async fn get_pending_messages(&self) -> Result<Vec<MeshMessage>> {
        self.request(NodeCommand::PendingMessages).await
    }

    pub async fn connection_state(&self, address: impl Into<PeerAddress>) -> Result<ConnectionState> {
        let address = address.into();
        self.request(|reply| NodeCommand::ConnectionState { address, reply })
            .await
    }

    /// Get service status
    pub async fn get_status(&self) -> Result<Value> {
        self.request(NodeCommand::Status).await
    }

    /// Get peer list, strongest signal first
    pub fn get_peer_list(&self) -> Vec<PeerRecord> {
        self.state.peers.get()
    }

    /// Stop the node: scanning and advertising end, links are closed
    pub async fn shutdown(&self) -> Result<()> {
        self.request(NodeCommand::Shutdown).await
    }

    fn post(&self, command: NodeCommand) {
        if self.commands.send(command).is_err() {
            debug!("Mesh node is not running, command dropped");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .ok()
            .context("Mesh node is not running")?;
        reply_rx.await.context("Mesh node stopped before replying")
    }
}

/// The single owner of all mesh tables
struct MeshNode {
    config: MeshConfig,
    radio: Arc<dyn Radio>,
    advertiser: Advertiser,
    scanner: Scanner,
    directory: PeerDirectory,
    connections: ConnectionManager,
    relay: RelayEngine,
    pending: PendingQueue,
    state: MeshState,
    events: broadcast::Sender<MeshEvent>,
    enabled: bool,
    scan_deadline: Option<Instant>,
}

impl MeshNode {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
        mut radio_events: RadioEvents,
        mut dial_failures: mpsc::UnboundedReceiver<PeerAddress>,
    ) {
        self.bring_up().await;
        let mut radio_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(NodeCommand::Shutdown(ack)) => {
                        self.shut_down().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shut_down().await;
                        break;
                    }
                },
                event = radio_events.recv(), if radio_open => match event {
                    Some(event) => self.handle_radio_event(event).await,
                    None => {
                        warn!("Radio event stream ended");
                        radio_open = false;
                        self.on_adapter_disabled();
                    }
                },
                Some(address) = dial_failures.recv() => self.on_dial_failed(address),
                _ = sleep_until(self.scan_deadline), if self.scan_deadline.is_some() => {
                    info!("Scan duration elapsed");
                    self.stop_scan().await;
                }
            }
        }

        info!("Bluetooth LE mesh node stopped");
    }

    /// Check the adapter, advertise, then optionally scan
    async fn bring_up(&mut self) {
        self.enabled = self.radio.is_enabled().await;
        self.state.bluetooth_enabled.set_if_changed(self.enabled);

        if !self.enabled {
            warn!("Bluetooth is not available");
            return;
        }

        self.advertiser.start(self.radio.as_ref()).await;

        // Scanning is independent of advertising: a central-only radio still scans.
        if self.config.auto_scan {
            self.start_scan().await;
        }
    }

    async fn shut_down(&mut self) {
        info!("Stopping Bluetooth LE mesh node");

        self.scanner.stop(self.radio.as_ref()).await;
        self.scan_deadline = None;
        self.state.scanning.set_if_changed(false);
        self.advertiser.stop(self.radio.as_ref()).await;

        for address in self.connections.close_all() {
            if let Err(e) = self.radio.disconnect(&address).await {
                warn!("Failed to disconnect from {}: {}", address, e);
            }
            self.peer_disconnected(address);
        }
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::SendMessage { content, reply } => {
                let message = self.send_message(content);
                let _ = reply.send(message);
            }
            NodeCommand::StartScan => self.start_scan().await,
            NodeCommand::StopScan => self.stop_scan().await,
            NodeCommand::SetDeviceInfo {
                device_id,
                device_name,
            } => {
                info!("Device info set: {} ({})", device_id, device_name);
                self.relay.set_local_id(device_id.clone());
                self.config.device_id = device_id;
                self.config.device_name = device_name.clone();
                self.advertiser.rename(device_name, self.radio.as_ref()).await;
            }
            NodeCommand::Connect(address) => {
                if self.enabled {
                    self.connections.dial(&address);
                } else {
                    debug!("Bluetooth disabled, not dialing {}", address);
                }
            }
            NodeCommand::Disconnect(address) => {
                if self.connections.close(&address) {
                    self.peer_disconnected(address);
                }
            }
            NodeCommand::QueueMessage(message) => {
                if self.pending.push(message) && self.connections.live_count() > 0 {
                    self.flush_pending();
                }
            }
            NodeCommand::MarkDelivered { message_id, reply } => {
                let _ = reply.send(self.pending.remove(&message_id));
            }
            NodeCommand::PendingMessages(reply) => {
                let _ = reply.send(self.pending.snapshot());
            }
            NodeCommand::ConnectionState { address, reply } => {
                let _ = reply.send(self.connections.state(&address));
            }
            NodeCommand::Status(reply) => {
                let _ = reply.send(self.get_status());
            }
            // Handled by the run loop
            NodeCommand::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }

    async fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdapterStateChanged { enabled: true } => {
                if !self.enabled {
                    info!("Bluetooth enabled");
                    self.bring_up().await;
                }
            }
            RadioEvent::AdapterStateChanged { enabled: false } => {
                if self.enabled {
                    warn!("Bluetooth disabled");
                    self.on_adapter_disabled();
                }
            }
            RadioEvent::Discovered(report) => self.on_discovered(report),
            RadioEvent::ScanFailed { reason } => {
                self.scanner.on_scan_failed(&reason);
                self.scan_deadline = None;
                self.state.scanning.set_if_changed(false);
            }
            RadioEvent::LinkUp(address) => {
                if self.connections.on_link_up(&address) {
                    self.peer_connected(address);
                }
            }
            RadioEvent::LinkDown(address) => {
                if self.connections.on_link_down(&address) {
                    self.peer_disconnected(address);
                }
            }
            RadioEvent::SubscriptionChanged {
                address,
                enabled: true,
            } => {
                if self.enabled {
                    self.connections.on_subscription(&address, true);
                }
            }
            RadioEvent::SubscriptionChanged {
                address,
                enabled: false,
            } => {
                if self.connections.on_subscription(&address, false) {
                    self.peer_disconnected(address);
                }
            }
            RadioEvent::FrameReceived { address, data } => self.on_frame(&address, &data),
            RadioEvent::ReadRequest {
                address,
                characteristic,
                reply,
            } => {
                let value = self.read_characteristic(&characteristic);
                debug!(
                    "Read of {} by {}: {}",
                    characteristic,
                    address,
                    if value.is_some() { "ok" } else { "not permitted" }
                );
                let _ = reply.send(value);
            }
        }
    }

    fn send_message(&mut self, content: String) -> MeshMessage {
        let message = MeshMessage::new(
            self.config.device_id.clone(),
            self.config.device_name.clone(),
            content,
        );
        self.relay.originate(&message);

        if self.connections.live_count() == 0 {
            info!("No connected peers, queued message {}", message.id);
            self.pending.push(message.clone());
        } else {
            let sent = self.push_to_all(&message);
            debug!("Sent message {} to {} peers", message.id, sent);
        }

        message
    }

    async fn start_scan(&mut self) {
        if !self.enabled {
            debug!("Bluetooth disabled, not scanning");
            return;
        }

        if self.scanner.start(self.radio.as_ref()).await {
            self.scan_deadline = self.config.scan_duration().map(|d| Instant::now() + d);
        }
        self.state.scanning.set_if_changed(self.scanner.is_scanning());
    }

    async fn stop_scan(&mut self) {
        self.scanner.stop(self.radio.as_ref()).await;
        self.scan_deadline = None;
        self.state.scanning.set_if_changed(false);
    }

    fn on_discovered(&mut self, report: super::radio::ScanReport) {
        let address = report.address.clone();
        let Some(sighting) = self.scanner.ingest(report, &mut self.directory) else {
            return;
        };

        // A link may predate the first sighting (inbound subscription).
        if sighting == Sighting::New {
            let live = self.connections.state(&address) == ConnectionState::Connected;
            self.directory.set_connected(&address, live);
        }
        self.state.peers.set(self.directory.snapshot());

        if sighting == Sighting::New && self.config.auto_connect && self.enabled {
            self.connections.dial(&address);
        }
    }

    fn on_dial_failed(&mut self, address: PeerAddress) {
        if self.connections.on_dial_failed(&address) {
            debug!("Dial to {} abandoned", address);
        }
    }

    fn on_frame(&mut self, address: &PeerAddress, data: &[u8]) {
        debug!("Received {} bytes from {}", data.len(), address);

        let Some(outcome) = self.relay.handle_frame(data) else {
            return;
        };

        if let Some(message) = outcome.deliver {
            info!(
                "Message from {}: {}",
                message.get_sender_display_name(),
                message.get_summary(40)
            );
            self.state.last_message.set(Some(message.clone()));
            let _ = self.events.send(MeshEvent::MessageReceived(message));
        }

        if let Some(next) = outcome.forward {
            self.push_to_all(&next);
        }
    }

    fn read_characteristic(&self, characteristic: &uuid::Uuid) -> Option<Vec<u8>> {
        if *characteristic == MESSAGE_CHARACTERISTIC_UUID {
            Some(IDENTITY.as_bytes().to_vec())
        } else if *characteristic == PEER_INFO_CHARACTERISTIC_UUID {
            Some(MeshProtocol::encode_peer_info(
                self.connections.live_count(),
                &self.config.device_model,
            ))
        } else {
            None
        }
    }

    /// Encode once and queue on every live link
    fn push_to_all(&self, message: &MeshMessage) -> usize {
        let frame = MeshProtocol::encode(message);
        if frame.len() > MAX_FRAME_LEN {
            warn!(
                "Message {} is {} bytes, over the {} byte frame limit; not sent",
                message.id,
                frame.len(),
                MAX_FRAME_LEN
            );
            return 0;
        }
        self.connections.broadcast(&frame)
    }

    fn flush_pending(&mut self) {
        let queued = self.pending.drain();
        if queued.is_empty() {
            return;
        }

        info!("Sending {} pending messages", queued.len());
        for message in queued {
            self.push_to_all(&message);
        }
    }

    fn peer_connected(&mut self, address: PeerAddress) {
        if self.directory.set_connected(&address, true) {
            self.state.peers.set(self.directory.snapshot());
        }
        self.state
            .connected
            .set_if_changed(self.connections.live_addresses());
        let _ = self.events.send(MeshEvent::PeerConnected(address));

        self.flush_pending();
    }

    fn peer_disconnected(&mut self, address: PeerAddress) {
        if self.directory.set_connected(&address, false) {
            self.state.peers.set(self.directory.snapshot());
        }
        self.state
            .connected
            .set_if_changed(self.connections.live_addresses());
        let _ = self.events.send(MeshEvent::PeerDisconnected(address));
    }

    /// Everything on air died with the adapter
    fn on_adapter_disabled(&mut self) {
        self.enabled = false;
        self.state.bluetooth_enabled.set_if_changed(false);

        self.scanner.reset();
        self.scan_deadline = None;
        self.state.scanning.set_if_changed(false);
        self.advertiser.reset();

        for address in self.connections.close_all() {
            self.peer_disconnected(address);
        }
    }

    fn get_status(&self) -> Value {
        serde_json::json!({
            "is_running": true,
            "bluetooth_enabled": self.enabled,
            "is_scanning": self.scanner.is_scanning(),
            "advertising": self.advertiser.state(),
            "device_id": self.config.device_id,
            "device_name": self.config.device_name,
            "connections": self.connections.live_count(),
            "pending_messages": self.pending.len(),
            "peer_statistics": self.directory.get_statistics(),
            "connection_statistics": self.connections.get_statistics(),
            "relay_statistics": self.relay.get_statistics(),
            "service_uuid": SERVICE_UUID.to_string(),
            "characteristic_uuid": MESSAGE_CHARACTERISTIC_UUID.to_string(),
            "state": self.state.get_current_state(),
        })
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
