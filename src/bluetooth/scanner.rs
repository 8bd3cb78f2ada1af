//! Peer Scanner
//!
//! Continuous scan with no report batching. Advertisements that pass the
//! filter are upserted into the [`PeerDirectory`].

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::peer_directory::{PeerDirectory, Sighting};
use super::radio::{Radio, ScanReport};

/// How advertisements are recognised as mesh peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanFilterMode {
    /// Case-insensitive substring match of the advertised name against the app name
    #[default]
    Name,
    /// Advertised service list must contain the mesh service UUID
    Service,
}

/// Scan state and advertisement filter
#[derive(Debug)]
pub struct Scanner {
    mode: ScanFilterMode,
    app_name: String,
    service_uuid: Uuid,
    scanning: bool,
}

impl Scanner {
    pub fn new(mode: ScanFilterMode, app_name: impl Into<String>, service_uuid: Uuid) -> Self {
        Self {
            mode,
            app_name: app_name.into(),
            service_uuid,
            scanning: false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Check whether an advertisement comes from a mesh peer
    ///
    /// Name matching is what deployed nodes rely on; it will also accept
    /// unrelated devices whose name happens to contain the app name.
    pub fn matches(&self, report: &ScanReport) -> bool {
        match self.mode {
            ScanFilterMode::Name => report
                .name
                .as_deref()
                .map(|name| name.to_lowercase().contains(&self.app_name.to_lowercase()))
                .unwrap_or(false),
            ScanFilterMode::Service => {
                report.name.is_some() && report.services.contains(&self.service_uuid)
            }
        }
    }

    /// Feed a scan result into the directory
    pub fn ingest(&self, report: ScanReport, directory: &mut PeerDirectory) -> Option<Sighting> {
        if !self.scanning || !self.matches(&report) {
            return None;
        }

        let name = report.name.unwrap_or_default();
        Some(directory.upsert(report.address, name, report.rssi))
    }

    /// Start scanning; returns true if a new scan began
    pub async fn start(&mut self, radio: &dyn Radio) -> bool {
        if self.scanning {
            return false;
        }

        // Flip first: the radio may replay cached advertisements synchronously.
        self.scanning = true;
        match radio.start_scan().await {
            Ok(()) => {
                info!("Starting BLE scan for {} peers", self.app_name);
                true
            }
            Err(e) => {
                warn!("Failed to start BLE scan: {}", e);
                self.scanning = false;
                false
            }
        }
    }

    /// Stop scanning; idempotent, status flips before the radio is told
    pub async fn stop(&mut self, radio: &dyn Radio) {
        let was_scanning = self.scanning;
        self.scanning = false;

        if let Err(e) = radio.stop_scan().await {
            debug!("Stopping BLE scan: {}", e);
        } else if was_scanning {
            info!("BLE scan stopped");
        }
    }

    /// The radio ended the scan on its own
    pub fn on_scan_failed(&mut self, reason: &str) {
        warn!("BLE scan failed: {}", reason);
        self.scanning = false;
    }

    /// Adapter went away; the scan died with it
    pub fn reset(&mut self) {
        self.scanning = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::loopback::Ether;
    use crate::bluetooth::protocol::{ADVERTISE_NAME, SERVICE_UUID};
    use crate::bluetooth::radio::PeerAddress;

    fn report(name: Option<&str>, rssi: i16, services: Vec<Uuid>) -> ScanReport {
        ScanReport {
            address: PeerAddress::new("AA:BB:CC:DD:EE:FF"),
            name: name.map(str::to_string),
            rssi,
            services,
        }
    }

    #[test]
    fn name_filter_is_case_insensitive_substring() {
        let scanner = Scanner::new(ScanFilterMode::Name, ADVERTISE_NAME, SERVICE_UUID);

        assert!(scanner.matches(&report(Some("AnoGram"), -50, vec![])));
        assert!(scanner.matches(&report(Some("my-anogram-phone"), -50, vec![])));
        assert!(!scanner.matches(&report(Some("Headphones"), -50, vec![SERVICE_UUID])));
        assert!(!scanner.matches(&report(None, -50, vec![SERVICE_UUID])));
    }

    #[test]
    fn service_filter_requires_the_mesh_service() {
        let scanner = Scanner::new(ScanFilterMode::Service, ADVERTISE_NAME, SERVICE_UUID);

        assert!(scanner.matches(&report(Some("Pixel"), -50, vec![SERVICE_UUID])));
        assert!(!scanner.matches(&report(Some("AnoGram"), -50, vec![])));
    }

    #[tokio::test]
    async fn ingest_only_while_scanning() {
        let ether = Ether::new();
        let (radio, _events) = ether.attach("self");
        let mut scanner = Scanner::new(ScanFilterMode::Name, ADVERTISE_NAME, SERVICE_UUID);
        let mut directory = PeerDirectory::new();

        assert!(scanner.ingest(report(Some("AnoGram"), -50, vec![]), &mut directory).is_none());

        assert!(scanner.start(&radio).await);
        assert_eq!(
            scanner.ingest(report(Some("AnoGram"), -50, vec![]), &mut directory),
            Some(Sighting::New)
        );
        assert_eq!(
            scanner.ingest(report(Some("AnoGram"), -35, vec![]), &mut directory),
            Some(Sighting::Updated)
        );
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.snapshot()[0].rssi, -35);
    }

    #[tokio::test]
    async fn start_is_noop_while_scanning_and_stop_is_idempotent() {
        let ether = Ether::new();
        let (radio, _events) = ether.attach("self");
        let mut scanner = Scanner::new(ScanFilterMode::Name, ADVERTISE_NAME, SERVICE_UUID);

        assert!(scanner.start(&radio).await);
        assert!(!scanner.start(&radio).await);
        assert!(ether.is_scanning(radio.address()));

        scanner.stop(&radio).await;
        scanner.stop(&radio).await;
        assert!(!scanner.is_scanning());
        assert!(!ether.is_scanning(radio.address()));
    }

    #[tokio::test]
    async fn start_fails_without_radio() {
        let ether = Ether::new();
        let (radio, _events) = ether.attach("self");
        ether.set_enabled(radio.address(), false);

        let mut scanner = Scanner::new(ScanFilterMode::Name, ADVERTISE_NAME, SERVICE_UUID);
        assert!(!scanner.start(&radio).await);
        assert!(!scanner.is_scanning());
    }
}
