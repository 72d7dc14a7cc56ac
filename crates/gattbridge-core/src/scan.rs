//! Scanner on/off state and the registry of devices seen while scanning.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use gattbridge_types::uuid::parse_filter;
use gattbridge_types::{DeviceId, DiscoveredDevice};

use crate::backend::{BleBackend, ScanEvent};
use crate::error::{Error, Result};
use crate::events::{EventMultiplexer, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Owns the scan and deduplicates what it finds.
///
/// Sightings accumulate across scans: a fresh `start` keeps what earlier
/// scans found, and repeated sightings update the existing entry.
pub struct ScanController {
    backend: Arc<dyn BleBackend>,
    state: ScanState,
    filter: Option<Uuid>,
    discovered: HashMap<DeviceId, DiscoveredDevice>,
    unknown_name: String,
}

impl ScanController {
    pub fn new(backend: Arc<dyn BleBackend>, unknown_name: impl Into<String>) -> Self {
        Self {
            backend,
            state: ScanState::Idle,
            filter: None,
            discovered: HashMap::new(),
            unknown_name: unknown_name.into(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Service filter of the running scan.
    pub fn filter(&self) -> Option<Uuid> {
        self.filter
    }

    /// Every device seen so far, most recently seen first.
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.discovered.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn get(&self, device_id: &str) -> Option<&DiscoveredDevice> {
        self.discovered.get(device_id)
    }

    /// Start scanning, optionally only for devices advertising `service_filter`.
    ///
    /// Already scanning is a successful no-op; the running filter is kept.
    pub async fn start(
        &mut self,
        service_filter: Option<&str>,
        events: &mut EventMultiplexer,
    ) -> Result<()> {
        if self.state == ScanState::Scanning {
            debug!("Scan already running");
            return Ok(());
        }
        let filter = parse_filter(service_filter)?;
        if !self.backend.is_powered().await {
            return Err(Error::BluetoothOff);
        }
        self.backend
            .start_scan(filter)
            .await
            .map_err(|e| Error::from_backend("start_scan", e))?;

        self.state = ScanState::Scanning;
        self.filter = filter;
        match filter {
            Some(uuid) => info!("Scanning for devices advertising {}", uuid),
            None => info!("Scanning for all devices"),
        }
        events.emit(SessionEvent::ScanStarted);
        Ok(())
    }

    /// Stop scanning. Always ends `Idle` and always emits `scan_stopped`.
    pub async fn stop(&mut self, events: &mut EventMultiplexer) {
        if self.state == ScanState::Scanning
            && let Err(e) = self.backend.stop_scan().await
        {
            warn!("Stopping scan failed: {}", e);
        }
        self.state = ScanState::Idle;
        self.filter = None;
        events.emit(SessionEvent::ScanStopped);
    }

    pub fn handle_event(&mut self, event: ScanEvent, events: &mut EventMultiplexer) {
        match event {
            ScanEvent::Result { device, name, rssi } => {
                if self.state != ScanState::Scanning {
                    debug!("Ignoring sighting of {} while idle", device);
                    return;
                }
                let entry = self
                    .discovered
                    .entry(device.clone())
                    .and_modify(|d| d.update(name.clone(), rssi))
                    .or_insert_with(|| DiscoveredDevice::new(device.clone(), name, rssi));
                let name = entry.display_name(&self.unknown_name).to_string();
                events.emit(SessionEvent::ScanResult {
                    device_id: device,
                    name,
                    rssi,
                });
            }
            ScanEvent::Failed { code } => {
                warn!("Scan failed with code {}", code);
                events.emit(SessionEvent::ScanFailed { code });
            }
        }
    }
}
