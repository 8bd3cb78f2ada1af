//! BLE radio on real hardware
//!
//! The central role (scan, dial, write, notifications) runs on btleplug.
//! The peripheral role (advertisement and GATT server) needs BlueZ and is
//! only present with the `bluez` feature on Linux; without it advertising
//! reports [`RadioError::Unsupported`] and the node runs central-only.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState as AdapterState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{MESSAGE_CHARACTERISTIC_UUID, SERVICE_UUID};
use super::radio::{
    AdvertisementData, PeerAddress, Radio, RadioError, RadioEvent, RadioEventSender, RadioEvents,
    ScanReport,
};
use crate::config::MeshConfig;

/// Reported when the stack gives no signal strength for an advertisement
const UNKNOWN_RSSI: i16 = -127;

/// Outbound link to a remote message channel
struct CentralLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    notifications: JoinHandle<()>,
}

impl Drop for CentralLink {
    fn drop(&mut self) {
        self.notifications.abort();
    }
}

#[derive(Default)]
struct CentralState {
    known: HashMap<PeerAddress, Peripheral>,
    addresses: HashMap<PeripheralId, PeerAddress>,
    links: HashMap<PeerAddress, CentralLink>,
}

/// Dual-role BLE radio backed by the host Bluetooth stack
pub struct BleRadio {
    adapter: Adapter,
    events: RadioEventSender,
    state: Arc<Mutex<CentralState>>,
    #[cfg(all(feature = "bluez", target_os = "linux"))]
    peripheral: Option<super::peripheral::BluezPeripheral>,
}

impl BleRadio {
    /// Open the first Bluetooth adapter and start listening for stack events
    pub async fn open(config: &MeshConfig) -> Result<(Self, RadioEvents)> {
        let manager = Manager::new()
            .await
            .context("Failed to create Bluetooth manager")?;

        let adapters = manager
            .adapters()
            .await
            .context("Failed to get Bluetooth adapters")?;

        let Some(adapter) = adapters.into_iter().next() else {
            bail!("No Bluetooth adapters found");
        };
        info!("Using Bluetooth adapter: {:?}", adapter.adapter_info().await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(CentralState::default()));

        let central_events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        tokio::spawn(watch_central(
            adapter.clone(),
            central_events,
            state.clone(),
            events_tx.clone(),
        ));

        #[cfg(all(feature = "bluez", target_os = "linux"))]
        let peripheral = match super::peripheral::BluezPeripheral::start(events_tx.clone()).await {
            Ok(peripheral) => Some(peripheral),
            Err(e) => {
                warn!("GATT server unavailable, running central-only: {}", e);
                None
            }
        };

        debug!("BLE radio opened for {}", config.device_name);

        let radio = Self {
            adapter,
            events: events_tx,
            state,
            #[cfg(all(feature = "bluez", target_os = "linux"))]
            peripheral,
        };
        Ok((radio, events_rx))
    }

    /// Find a peripheral by address, consulting the adapter if discovery missed it
    async fn lookup(&self, address: &PeerAddress) -> Result<Peripheral, RadioError> {
        let cached = self.state.lock().known.get(address).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string() == address.as_str() {
                let mut state = self.state.lock();
                state.addresses.insert(peripheral.id(), address.clone());
                state.known.insert(address.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(RadioError::UnknownPeer(address.clone()))
    }
}

#[async_trait]
impl Radio for BleRadio {
    async fn is_enabled(&self) -> bool {
        #[cfg(all(feature = "bluez", target_os = "linux"))]
        if let Some(peripheral) = &self.peripheral {
            return peripheral.is_powered().await;
        }

        match self.adapter.adapter_state().await {
            Ok(state) => adapter_power(state).unwrap_or(false),
            Err(e) => {
                debug!("Adapter state unavailable: {}", e);
                false
            }
        }
    }

    #[allow(unused_variables)]
    async fn start_advertising(&self, advertisement: &AdvertisementData) -> Result<(), RadioError> {
        #[cfg(all(feature = "bluez", target_os = "linux"))]
        if let Some(peripheral) = &self.peripheral {
            return peripheral.advertise(advertisement).await;
        }

        Err(RadioError::Unsupported("peripheral"))
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        #[cfg(all(feature = "bluez", target_os = "linux"))]
        if let Some(peripheral) = &self.peripheral {
            peripheral.stop_advertising();
        }

        Ok(())
    }

    async fn start_scan(&self) -> Result<(), RadioError> {
        // No service filter: peers are recognised by name, which many
        // advertisers send without the service list.
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn dial(&self, address: &PeerAddress) -> Result<(), RadioError> {
        let peripheral = self.lookup(address).await?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let (characteristic, notifications) =
            match open_channel(&peripheral, address, &self.events).await {
                Ok(channel) => channel,
                Err(e) => {
                    if let Err(cleanup) = peripheral.disconnect().await {
                        debug!("Disconnect after failed dial to {}: {}", address, cleanup);
                    }
                    return Err(e);
                }
            };

        self.state.lock().links.insert(
            address.clone(),
            CentralLink {
                peripheral,
                characteristic,
                notifications,
            },
        );
        let _ = self.events.send(RadioEvent::LinkUp(address.clone()));
        Ok(())
    }

    async fn disconnect(&self, address: &PeerAddress) -> Result<(), RadioError> {
        let peripheral = {
            let mut state = self.state.lock();
            match state.links.remove(address) {
                Some(link) => Some(link.peripheral.clone()),
                // No link recorded, but an abandoned dial may still hold one.
                None => state.known.get(address).cloned(),
            }
        };

        let Some(peripheral) = peripheral else {
            return Ok(());
        };
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn write(&self, address: &PeerAddress, frame: &[u8]) -> Result<(), RadioError> {
        let target = self
            .state
            .lock()
            .links
            .get(address)
            .map(|link| (link.peripheral.clone(), link.characteristic.clone()));

        let (peripheral, characteristic) =
            target.ok_or_else(|| RadioError::NotConnected(address.clone()))?;
        peripheral
            .write(&characteristic, frame, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }
}

/// Translate adapter events into radio events
async fn watch_central(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    state: Arc<Mutex<CentralState>>,
    events: RadioEventSender,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Err(e) = report_sighting(&adapter, &id, &state, &events).await {
                    debug!("Ignoring advertisement from {:?}: {}", id, e);
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let address = {
                    let mut state = state.lock();
                    let address = state.addresses.get(&id).cloned();
                    if let Some(address) = &address {
                        state.links.remove(address);
                    }
                    address
                };
                if let Some(address) = address {
                    let _ = events.send(RadioEvent::LinkDown(address));
                }
            }
            CentralEvent::StateUpdate(adapter_state) => {
                if let Some(enabled) = adapter_power(adapter_state) {
                    info!("Adapter powered {}", if enabled { "on" } else { "off" });
                    if !enabled {
                        state.lock().links.clear();
                    }
                    let _ = events.send(RadioEvent::AdapterStateChanged { enabled });
                }
            }
            _ => {}
        }
    }

    warn!("Adapter event stream ended");
    let _ = events.send(RadioEvent::ScanFailed {
        reason: "adapter event stream ended".into(),
    });
}

async fn report_sighting(
    adapter: &Adapter,
    id: &PeripheralId,
    state: &Mutex<CentralState>,
    events: &RadioEventSender,
) -> Result<(), RadioError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(());
    };

    let address = PeerAddress::new(properties.address.to_string());
    {
        let mut state = state.lock();
        state.addresses.insert(id.clone(), address.clone());
        state.known.insert(address.clone(), peripheral);
    }

    let _ = events.send(RadioEvent::Discovered(ScanReport {
        address,
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or(UNKNOWN_RSSI),
        services: properties.services,
    }));
    Ok(())
}

/// Subscribe to the remote message channel and forward its notifications
async fn open_channel(
    peripheral: &Peripheral,
    address: &PeerAddress,
    events: &RadioEventSender,
) -> Result<(Characteristic, JoinHandle<()>), RadioError> {
    peripheral.discover_services().await?;
    let characteristic = peripheral
        .services()
        .iter()
        .find(|s| s.uuid == SERVICE_UUID)
        .and_then(|s| {
            s.characteristics
                .iter()
                .find(|c| c.uuid == MESSAGE_CHARACTERISTIC_UUID)
                .cloned()
        })
        .ok_or_else(|| RadioError::Link(format!("{} has no mesh message channel", address)))?;

    peripheral.subscribe(&characteristic).await?;
    let mut notifications = peripheral.notifications().await?;

    let events = events.clone();
    let source = address.clone();
    let notifications = tokio::spawn(async move {
        while let Some(notification) = notifications.next().await {
            if notification.uuid != MESSAGE_CHARACTERISTIC_UUID {
                continue;
            }
            let _ = events.send(RadioEvent::FrameReceived {
                address: source.clone(),
                data: notification.value,
            });
        }
        debug!("Notification stream ended for {}", source);
    });

    Ok((characteristic, notifications))
}

/// Powered state of the adapter, if the stack knows it
fn adapter_power(state: AdapterState) -> Option<bool> {
    match state {
        AdapterState::PoweredOn => Some(true),
        AdapterState::PoweredOff => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_power_follows_stack_state() {
        assert_eq!(adapter_power(AdapterState::PoweredOn), Some(true));
        assert_eq!(adapter_power(AdapterState::PoweredOff), Some(false));
        assert_eq!(adapter_power(AdapterState::Unknown), None);
    }
}
