//! BlueZ peripheral role
//!
//! GATT server and advertisement for Linux hosts. Remote reads, writes and
//! notification subscriptions are handed to the node as radio events; the
//! node answers reads over a oneshot reply.

use bluer::adv::{Advertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic,
    CharacteristicControl, CharacteristicControlEvent, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use bluer::Address;
use futures::{pin_mut, FutureExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::protocol::{MESSAGE_CHARACTERISTIC_UUID, PEER_INFO_CHARACTERISTIC_UUID};
use super::radio::{AdvertisementData, PeerAddress, RadioError, RadioEvent, RadioEventSender};

pub struct BluezPeripheral {
    adapter: bluer::Adapter,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    _application: ApplicationHandle,
    _session: bluer::Session,
}

impl BluezPeripheral {
    /// Power the default adapter and publish the mesh GATT service
    pub async fn start(events: RadioEventSender) -> bluer::Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let (control, control_handle) = characteristic_control();
        tokio::spawn(watch_subscriptions(control, events.clone()));

        let application = Application {
            services: vec![Service {
                uuid: super::protocol::SERVICE_UUID,
                primary: true,
                characteristics: vec![
                    Characteristic {
                        uuid: MESSAGE_CHARACTERISTIC_UUID,
                        read: Some(read_through(events.clone(), MESSAGE_CHARACTERISTIC_UUID)),
                        write: Some(write_through(events.clone())),
                        notify: Some(CharacteristicNotify {
                            notify: true,
                            method: CharacteristicNotifyMethod::Io,
                            ..Default::default()
                        }),
                        control_handle,
                        ..Default::default()
                    },
                    Characteristic {
                        uuid: PEER_INFO_CHARACTERISTIC_UUID,
                        read: Some(read_through(events, PEER_INFO_CHARACTERISTIC_UUID)),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };

        let application = adapter.serve_gatt_application(application).await?;
        info!("GATT server registered on {}", adapter.name());

        Ok(Self {
            adapter,
            advertisement: Mutex::new(None),
            _application: application,
            _session: session,
        })
    }

    pub async fn is_powered(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    /// Replace the running advertisement
    pub async fn advertise(&self, data: &AdvertisementData) -> Result<(), RadioError> {
        let advertisement = Advertisement {
            advertisement_type: if data.connectable {
                Type::Peripheral
            } else {
                Type::Broadcast
            },
            service_uuids: [data.service_uuid].into_iter().collect(),
            local_name: Some(data.local_name.clone()),
            discoverable: Some(true),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(advertisement)
            .await
            .map_err(|e| RadioError::Link(e.to_string()))?;
        debug!(
            "Advertising {:?} (requested interval {:?})",
            data.local_name, data.interval
        );

        // Dropping the previous handle withdraws it.
        *self.advertisement.lock() = Some(handle);
        Ok(())
    }

    pub fn stop_advertising(&self) {
        self.advertisement.lock().take();
    }
}

fn peer(address: Address) -> PeerAddress {
    PeerAddress::new(address.to_string())
}

/// Reads are answered by the node
fn read_through(events: RadioEventSender, characteristic: Uuid) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |request| {
            let events = events.clone();
            async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                events
                    .send(RadioEvent::ReadRequest {
                        address: peer(request.device_address),
                        characteristic,
                        reply: reply_tx,
                    })
                    .map_err(|_| ReqError::Failed)?;

                match reply_rx.await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(ReqError::NotPermitted),
                    Err(_) => Err(ReqError::Failed),
                }
            }
            .boxed()
        }),
        ..Default::default()
    }
}

/// Every write to the message channel is one inbound frame
fn write_through(events: RadioEventSender) -> CharacteristicWrite {
    CharacteristicWrite {
        write: true,
        write_without_response: true,
        method: CharacteristicWriteMethod::Fun(Box::new(move |value, request| {
            let events = events.clone();
            async move {
                events
                    .send(RadioEvent::FrameReceived {
                        address: peer(request.device_address),
                        data: value,
                    })
                    .map_err(|_| ReqError::Failed)
            }
            .boxed()
        })),
        ..Default::default()
    }
}

/// A notification session opening or closing is the remote's enable or
/// disable write to the configuration descriptor
async fn watch_subscriptions(control: CharacteristicControl, events: RadioEventSender) {
    pin_mut!(control);

    while let Some(event) = control.next().await {
        match event {
            CharacteristicControlEvent::Notify(writer) => {
                let address = peer(writer.device_address());
                debug!("{} subscribed to the message channel", address);
                let _ = events.send(RadioEvent::SubscriptionChanged {
                    address: address.clone(),
                    enabled: true,
                });

                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = writer.closed().await {
                        debug!("Notification session with {} ended: {}", address, e);
                    }
                    let _ = events.send(RadioEvent::SubscriptionChanged {
                        address,
                        enabled: false,
                    });
                });
            }
            CharacteristicControlEvent::Write(_) => {
                warn!("Unexpected streamed write on the message channel");
            }
        }
    }
}
