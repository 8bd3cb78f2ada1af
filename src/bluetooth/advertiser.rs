//! Advertiser
//!
//! Connectable advertisement carrying only the mesh service UUID and the
//! node's display name. A failed start is logged once and left alone.

use log::{error, info, warn};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::radio::{AdvertisementData, Radio};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdvertiserState {
    Idle,
    Advertising,
    Failed,
}

#[derive(Debug)]
pub struct Advertiser {
    service_uuid: Uuid,
    name: String,
    interval: Duration,
    state: AdvertiserState,
}

impl Advertiser {
    pub fn new(service_uuid: Uuid, name: impl Into<String>, interval: Duration) -> Self {
        Self {
            service_uuid,
            name: name.into(),
            interval,
            state: AdvertiserState::Idle,
        }
    }

    pub fn state(&self) -> AdvertiserState {
        self.state
    }

    /// Advertisement payload for the current identity
    pub fn advertisement(&self) -> AdvertisementData {
        AdvertisementData {
            service_uuid: self.service_uuid,
            local_name: self.name.clone(),
            connectable: true,
            interval: self.interval,
        }
    }

    /// Begin advertising; returns true on success
    pub async fn start(&mut self, radio: &dyn Radio) -> bool {
        match radio.start_advertising(&self.advertisement()).await {
            Ok(()) => {
                info!("BLE advertising started as {:?}", self.name);
                self.state = AdvertiserState::Advertising;
                true
            }
            Err(e) => {
                error!("BLE advertising failed: {}", e);
                self.state = AdvertiserState::Failed;
                false
            }
        }
    }

    pub async fn stop(&mut self, radio: &dyn Radio) {
        if self.state == AdvertiserState::Advertising {
            if let Err(e) = radio.stop_advertising().await {
                warn!("Failed to stop BLE advertising: {}", e);
            }
        }
        self.state = AdvertiserState::Idle;
    }

    /// Change the advertised name, refreshing a running advertisement
    pub async fn rename(&mut self, name: impl Into<String>, radio: &dyn Radio) {
        self.name = name.into();

        if self.state == AdvertiserState::Advertising {
            if let Err(e) = radio.stop_advertising().await {
                warn!("Failed to stop BLE advertising: {}", e);
            }
            self.start(radio).await;
        }
    }

    /// Adapter went away; whatever was on air is gone
    pub fn reset(&mut self) {
        self.state = AdvertiserState::Idle;
    }
}
