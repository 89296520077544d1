//! Peripheral scanning and discovery de-duplication

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::BleSerialConfig;
use crate::error::{BleSerialError, PlatformError};
use crate::observer::ScanObserver;
use crate::peripheral::{Peripheral, PeripheralId};
use crate::platform::{BlePlatform, RadioState};
use crate::protocol::ServiceSet;

// ----------------------------------------------------------------------------
// Scan Result
// ----------------------------------------------------------------------------

/// Snapshot of every currently known peripheral, unique by identifier and
/// ordered by identifier
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResult {
    peripherals: Vec<Peripheral>,
}

impl ScanResult {
    pub fn iter(&self) -> std::slice::Iter<'_, Peripheral> {
        self.peripherals.iter()
    }

    pub fn len(&self) -> usize {
        self.peripherals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.is_empty()
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.peripherals.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.get(id).is_some()
    }

    pub fn into_vec(self) -> Vec<Peripheral> {
        self.peripherals
    }
}

impl<'a> IntoIterator for &'a ScanResult {
    type Item = &'a Peripheral;
    type IntoIter = std::slice::Iter<'a, Peripheral>;

    fn into_iter(self) -> Self::IntoIter {
        self.peripherals.iter()
    }
}

// ----------------------------------------------------------------------------
// Discovered Set
// ----------------------------------------------------------------------------

/// Known peripherals keyed by identifier
#[derive(Debug, Default)]
pub(crate) struct DiscoveredSet {
    peripherals: HashMap<PeripheralId, Peripheral>,
}

impl DiscoveredSet {
    /// Insert or refresh a peripheral. Returns true for a first sighting.
    pub fn upsert(&mut self, peripheral: Peripheral) -> bool {
        match self.peripherals.get_mut(&peripheral.id) {
            Some(known) => {
                if peripheral.name.is_some() {
                    known.name = peripheral.name;
                }
                if !peripheral.services.is_empty() {
                    known.services = peripheral.services;
                }
                if peripheral.rssi.is_some() {
                    known.rssi = peripheral.rssi;
                }
                false
            }
            None => {
                self.peripherals.insert(peripheral.id.clone(), peripheral);
                true
            }
        }
    }

    pub fn remove(&mut self, id: &PeripheralId) -> bool {
        self.peripherals.remove(id).is_some()
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.peripherals.contains_key(id)
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&Peripheral> {
        self.peripherals.get(id)
    }

    pub fn clear(&mut self) {
        self.peripherals.clear();
    }

    pub fn snapshot(&self) -> ScanResult {
        let mut peripherals: Vec<Peripheral> = self.peripherals.values().cloned().collect();
        peripherals.sort_by(|a, b| a.id.cmp(&b.id));
        ScanResult { peripherals }
    }
}

// ----------------------------------------------------------------------------
// Scan Session
// ----------------------------------------------------------------------------

/// Drives the platform scan and keeps the set of usable peripherals
pub(crate) struct ScanSession {
    services: ServiceSet,
    target: Option<PeripheralId>,
    known: DiscoveredSet,
    observer: Option<Arc<dyn ScanObserver>>,
    scanning: bool,
    /// Bumped on every start so stale scan timers can be told apart
    generation: u64,
}

impl ScanSession {
    pub fn new(config: &BleSerialConfig) -> Self {
        Self {
            services: config.service_uuids.clone(),
            target: config.target_peripheral.clone(),
            known: DiscoveredSet::default(),
            observer: None,
            scanning: false,
            generation: 0,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Whether `id` came from a discovery that is still valid
    pub fn is_known(&self, id: &PeripheralId) -> bool {
        self.known.contains(id)
    }

    /// Latest advertised data of a usable peripheral
    pub fn lookup(&self, id: &PeripheralId) -> Option<Peripheral> {
        self.known.get(id).cloned()
    }

    /// Start scanning. Returns the scan generation when a new scan began.
    pub async fn start(
        &mut self,
        observer: Arc<dyn ScanObserver>,
        platform: &dyn BlePlatform,
    ) -> Option<u64> {
        if self.scanning {
            debug!("Scan already running, ignoring start");
            return None;
        }

        if let Some(error) = radio_error(platform.radio_state().await) {
            warn!("Cannot scan: {}", error);
            observer.on_scan_failed(&error);
            return None;
        }

        if let Err(e) = platform.start_scan(&self.services).await {
            let error = scan_error(e);
            warn!("Failed to start BLE scan: {}", error);
            observer.on_scan_failed(&error);
            return None;
        }

        self.known.clear();
        self.observer = Some(observer);
        self.scanning = true;
        self.generation += 1;
        info!(
            "Started BLE scanning for {} service(s)",
            self.services.uuids().len()
        );
        Some(self.generation)
    }

    /// Stop scanning; idempotent
    pub async fn stop(&mut self, platform: &dyn BlePlatform) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        self.observer = None;
        if let Err(e) = platform.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }
        info!("Stopped BLE scanning");
    }

    /// Scan timer fired
    pub async fn on_timeout(&mut self, generation: u64, platform: &dyn BlePlatform) {
        if self.scanning && generation == self.generation {
            debug!("Scan timeout reached");
            self.stop(platform).await;
        }
    }

    pub fn on_discovered(&mut self, peripheral: Peripheral) {
        if !self.scanning {
            trace!("Ignoring advertisement from {} while not scanning", peripheral.id);
            return;
        }
        if self.target.as_ref().is_some_and(|target| *target != peripheral.id) {
            return;
        }
        if !self.known.contains(&peripheral.id) && !self.services.matches(&peripheral.services) {
            trace!("Ignoring {}: no matching service", peripheral.id);
            return;
        }

        let id = peripheral.id.clone();
        if self.known.upsert(peripheral) {
            debug!("Discovered peripheral {}", id);
        }
        self.publish();
    }

    /// Drop a peripheral that went stale
    pub fn forget(&mut self, id: &PeripheralId) {
        if self.known.remove(id) {
            debug!("Peripheral {} is no longer usable", id);
            if self.scanning {
                self.publish();
            }
        }
    }

    pub fn on_radio_state(&mut self, state: RadioState) {
        if !self.scanning {
            return;
        }
        if let Some(error) = radio_error(state) {
            warn!("Scanning interrupted: {}", error);
            self.scanning = false;
            if let Some(observer) = self.observer.take() {
                observer.on_scan_failed(&error);
            }
        }
    }

    fn publish(&self) {
        if let Some(observer) = &self.observer {
            observer.on_peripherals_updated(&self.known.snapshot());
        }
    }
}

fn radio_error(state: RadioState) -> Option<BleSerialError> {
    match state {
        RadioState::Available => None,
        RadioState::Unauthorized => Some(BleSerialError::Unauthorized),
        RadioState::PoweredOff | RadioState::Unsupported => Some(BleSerialError::RadioUnavailable),
    }
}

fn scan_error(error: PlatformError) -> BleSerialError {
    match error {
        PlatformError::RadioUnavailable => BleSerialError::RadioUnavailable,
        PlatformError::Unauthorized => BleSerialError::Unauthorized,
        other => BleSerialError::Platform(other),
    }
}
