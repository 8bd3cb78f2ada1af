//! Loopback Radio
//!
//! In-process stand-in for the air between nodes. Every [`LoopbackRadio`]
//! attached to the same [`Ether`] can hear the others' advertisements, dial
//! them and write frames to them, with the same event sequence a BLE stack
//! produces: a dial raises `LinkUp` on the initiator and a notification
//! subscription on the acceptor.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::radio::{
    AdvertisementData, PeerAddress, Radio, RadioError, RadioEvent, RadioEventSender, RadioEvents,
    ScanReport,
};

/// Signal strength reported for stations that never had one set
pub const DEFAULT_RSSI: i16 = -60;

struct Station {
    events: RadioEventSender,
    enabled: bool,
    advertisement: Option<AdvertisementData>,
    scanning: bool,
    rssi: i16,
    outbound: HashSet<PeerAddress>,
}

impl Station {
    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, address: &PeerAddress) -> Option<ScanReport> {
        let advertisement = self.advertisement.as_ref()?;
        Some(ScanReport {
            address: address.clone(),
            name: Some(advertisement.local_name.clone()),
            rssi: self.rssi,
            services: vec![advertisement.service_uuid],
        })
    }
}

#[derive(Default)]
struct EtherState {
    stations: HashMap<PeerAddress, Station>,
}

impl EtherState {
    /// Deliver `address`'s advertisement to every other scanning station
    fn announce(&self, address: &PeerAddress) {
        let Some(report) = self.stations.get(address).and_then(|s| s.report(address)) else {
            return;
        };

        for (other, station) in &self.stations {
            if other != address && station.enabled && station.scanning {
                station.emit(RadioEvent::Discovered(report.clone()));
            }
        }
    }

    /// Tear down both directions between two stations as a remote loss would
    fn sever(&mut self, a: &PeerAddress, b: &PeerAddress) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(station) = self.stations.get_mut(from) {
                if station.outbound.remove(to) {
                    station.emit(RadioEvent::LinkDown(to.clone()));
                }
            }
        }
    }
}

/// Shared medium connecting loopback radios
#[derive(Clone, Default)]
pub struct Ether {
    inner: Arc<Mutex<EtherState>>,
}

impl Ether {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a powered station with the given address
    pub fn attach(&self, address: impl Into<PeerAddress>) -> (LoopbackRadio, RadioEvents) {
        let address = address.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        self.inner.lock().stations.insert(
            address.clone(),
            Station {
                events: events_tx,
                enabled: true,
                advertisement: None,
                scanning: false,
                rssi: DEFAULT_RSSI,
                outbound: HashSet::new(),
            },
        );

        let radio = LoopbackRadio {
            address,
            ether: self.clone(),
        };
        (radio, events_rx)
    }

    /// Change how strongly a station is heard and re-announce it
    pub fn set_signal_strength(&self, address: &PeerAddress, rssi: i16) {
        let mut state = self.inner.lock();
        if let Some(station) = state.stations.get_mut(address) {
            station.rssi = rssi;
        }
        state.announce(address);
    }

    /// Power a station's adapter on or off; powering off drops its links
    pub fn set_enabled(&self, address: &PeerAddress, enabled: bool) {
        let mut state = self.inner.lock();

        if !enabled {
            let mut linked: Vec<PeerAddress> = state
                .stations
                .get(address)
                .map(|s| s.outbound.iter().cloned().collect())
                .unwrap_or_default();
            linked.extend(
                state
                    .stations
                    .iter()
                    .filter(|(_, station)| station.outbound.contains(address))
                    .map(|(other, _)| other.clone()),
            );
            for peer in linked {
                state.sever(address, &peer);
            }
        }

        if let Some(station) = state.stations.get_mut(address) {
            station.enabled = enabled;
            if !enabled {
                station.scanning = false;
                station.advertisement = None;
            }
            station.emit(RadioEvent::AdapterStateChanged { enabled });
        }
    }

    /// Drop the link between two stations from the remote side
    pub fn sever(&self, a: &PeerAddress, b: &PeerAddress) {
        self.inner.lock().sever(a, b);
    }

    /// Deliver raw bytes to a station as if `from` had written them
    pub fn inject_frame(&self, to: &PeerAddress, from: &PeerAddress, data: &[u8]) {
        if let Some(station) = self.inner.lock().stations.get(to) {
            station.emit(RadioEvent::FrameReceived {
                address: from.clone(),
                data: data.to_vec(),
            });
        }
    }

    /// Deliver a configuration-descriptor write to a station
    pub fn inject_subscription(&self, to: &PeerAddress, from: &PeerAddress, enabled: bool) {
        if let Some(station) = self.inner.lock().stations.get(to) {
            station.emit(RadioEvent::SubscriptionChanged {
                address: from.clone(),
                enabled,
            });
        }
    }

    /// Whether `from` holds an outbound link to `to`
    pub fn is_linked(&self, from: &PeerAddress, to: &PeerAddress) -> bool {
        self.inner
            .lock()
            .stations
            .get(from)
            .map(|s| s.outbound.contains(to))
            .unwrap_or(false)
    }

    pub fn is_scanning(&self, address: &PeerAddress) -> bool {
        self.inner
            .lock()
            .stations
            .get(address)
            .map(|s| s.scanning)
            .unwrap_or(false)
    }

    /// Name currently advertised by a station
    pub fn advertised_name(&self, address: &PeerAddress) -> Option<String> {
        self.inner
            .lock()
            .stations
            .get(address)
            .and_then(|s| s.advertisement.as_ref().map(|a| a.local_name.clone()))
    }
}

/// Radio handle for one station on an [`Ether`]
#[derive(Clone)]
pub struct LoopbackRadio {
    address: PeerAddress,
    ether: Ether,
}

impl LoopbackRadio {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn ensure_enabled(&self, state: &EtherState) -> Result<(), RadioError> {
        match state.stations.get(&self.address) {
            Some(station) if station.enabled => Ok(()),
            _ => Err(RadioError::Unavailable),
        }
    }
}

#[async_trait]
impl Radio for LoopbackRadio {
    async fn is_enabled(&self) -> bool {
        self.ether
            .inner
            .lock()
            .stations
            .get(&self.address)
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError> {
        let mut state = self.ether.inner.lock();
        self.ensure_enabled(&state)?;

        if let Some(station) = state.stations.get_mut(&self.address) {
            station.advertisement = Some(advertisement.clone());
        }
        state.announce(&self.address);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        if let Some(station) = self.ether.inner.lock().stations.get_mut(&self.address) {
            station.advertisement = None;
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        let mut state = self.ether.inner.lock();
        self.ensure_enabled(&state)?;

        let reports: Vec<ScanReport> = state
            .stations
            .iter()
            .filter(|(address, station)| **address != self.address && station.enabled)
            .filter_map(|(address, station)| station.report(address))
            .collect();

        if let Some(station) = state.stations.get_mut(&self.address) {
            station.scanning = true;
            for report in reports {
                station.emit(RadioEvent::Discovered(report));
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        if let Some(station) = self.ether.inner.lock().stations.get_mut(&self.address) {
            station.scanning = false;
        }
        Ok(())
    }

    async fn dial(&self, address: &PeerAddress) -> Result<(), RadioError> {
        let mut state = self.ether.inner.lock();
        self.ensure_enabled(&state)?;

        match state.stations.get(address) {
            Some(remote) if remote.enabled => {
                // The initiator subscribes to the remote message channel once connected.
                remote.emit(RadioEvent::SubscriptionChanged {
                    address: self.address.clone(),
                    enabled: true,
                });
            }
            _ => return Err(RadioError::UnknownPeer(address.clone())),
        }

        if let Some(station) = state.stations.get_mut(&self.address) {
            station.outbound.insert(address.clone());
            station.emit(RadioEvent::LinkUp(address.clone()));
        }
        debug!("Loopback link {} -> {} up", self.address, address);
        Ok(())
    }

    async fn disconnect(&self, address: &PeerAddress) -> Result<(), RadioError> {
        let mut state = self.ether.inner.lock();

        let removed = state
            .stations
            .get_mut(&self.address)
            .map(|s| s.outbound.remove(address))
            .unwrap_or(false);

        if removed {
            if let Some(remote) = state.stations.get(address) {
                remote.emit(RadioEvent::SubscriptionChanged {
                    address: self.address.clone(),
                    enabled: false,
                });
            }
            debug!("Loopback link {} -> {} closed", self.address, address);
        }
        Ok(())
    }

    async fn write(&self, address: &PeerAddress, frame: &[u8]) -> Result<(), RadioError> {
        let state = self.ether.inner.lock();

        let linked = state
            .stations
            .get(&self.address)
            .map(|s| s.enabled && s.outbound.contains(address))
            .unwrap_or(false);
        if !linked {
            return Err(RadioError::NotConnected(address.clone()));
        }

        match state.stations.get(address) {
            Some(remote) => {
                remote.emit(RadioEvent::FrameReceived {
                    address: self.address.clone(),
                    data: frame.to_vec(),
                });
                Ok(())
            }
            None => Err(RadioError::UnknownPeer(address.clone())),
        }
    }
}
