//! In-memory platform with scripted peripherals
//!
//! Peripherals are registered up front and advertise whenever a scan starts.
//! Echo peripherals send every written chunk back as a notification on their
//! notify characteristic, which makes a loopback serial link. Faults (connect
//! failure, hang or late success, slow or failing discovery, write failure,
//! RSSI failure, unanswered disconnects, radio state) are injected through
//! the builder and control methods.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    BlePlatform, CharPropFlags, CharacteristicInfo, PlatformEvent, PlatformEventSender,
    RadioState, WriteType,
};
use crate::error::{PlatformError, PlatformResult};
use crate::peripheral::{Peripheral, PeripheralId};
use crate::protocol::{ServiceSet, SERIAL_SERVICE_FFF0};

// ----------------------------------------------------------------------------
// Simulated Peripheral
// ----------------------------------------------------------------------------

/// How a simulated peripheral answers a connect request
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectBehavior {
    Succeed,
    Fail(String),
    /// Never answers until a disconnect is requested
    Hang,
    /// Brings the link up after a delay, whatever happened meanwhile
    SucceedAfter(Duration),
}

/// A scripted peripheral
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub peripheral: Peripheral,
    pub characteristics: Vec<CharacteristicInfo>,
    pub connect: ConnectBehavior,
    pub discovery_error: Option<String>,
    pub discovery_delay: Option<Duration>,
    /// Reflect writes back as notifications
    pub echo: bool,
    pub rssi: i16,
    pub max_write_len: Option<usize>,
}

impl SimulatedPeripheral {
    /// A peripheral with no characteristics
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Vec::new(),
            connect: ConnectBehavior::Succeed,
            discovery_error: None,
            discovery_delay: None,
            echo: false,
            rssi: -60,
            max_write_len: None,
        }
    }

    /// An FFF0 serial adapter that loops every write back to the input stream
    pub fn echo_adapter(id: impl Into<PeripheralId>, name: &str) -> Self {
        let peripheral = Peripheral::new(id)
            .with_name(name)
            .with_service(SERIAL_SERVICE_FFF0);
        Self::new(peripheral)
            .with_characteristic(CharacteristicInfo {
                service: SERIAL_SERVICE_FFF0,
                uuid: uuid_from_u16(0xFFF1),
                properties: CharPropFlags::NOTIFY,
            })
            .with_characteristic(CharacteristicInfo {
                service: SERIAL_SERVICE_FFF0,
                uuid: uuid_from_u16(0xFFF2),
                properties: CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
            })
            .with_echo(true)
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicInfo) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    pub fn with_connect(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    pub fn with_discovery_error(mut self, reason: impl Into<String>) -> Self {
        self.discovery_error = Some(reason.into());
        self
    }

    pub fn with_discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = Some(delay);
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = Some(len);
        self
    }

    fn notify_characteristic(&self) -> Option<&CharacteristicInfo> {
        self.characteristics
            .iter()
            .find(|c| c.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE))
    }
}

// ----------------------------------------------------------------------------
// Simulated Platform
// ----------------------------------------------------------------------------

struct SimState {
    radio: RadioState,
    events: Option<PlatformEventSender>,
    scanning: bool,
    scan_filter: ServiceSet,
    peripherals: HashMap<PeripheralId, SimulatedPeripheral>,
    connected: HashSet<PeripheralId>,
    subscribed: HashSet<(PeripheralId, Uuid)>,
    pending_connects: HashMap<PeripheralId, Arc<Notify>>,
    written: HashMap<PeripheralId, Vec<Vec<u8>>>,
    /// Writes left before the next one fails
    fail_write_after: Option<usize>,
    rssi_failure: Option<String>,
    disconnect_failure: Option<String>,
    /// Disconnect requests never answer
    disconnect_stalled: bool,
    connect_attempts: usize,
    rssi_reads: usize,
    rssi_reads_while_disconnected: usize,
}

impl SimState {
    fn emit(&self, event: PlatformEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                trace!("Simulated platform event dropped, no receiver");
            }
        }
    }
}

/// In-memory [`BlePlatform`]
#[derive(Clone)]
pub struct SimulatedPlatform {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                radio: RadioState::Available,
                events: None,
                scanning: false,
                scan_filter: ServiceSet::default(),
                peripherals: HashMap::new(),
                connected: HashSet::new(),
                subscribed: HashSet::new(),
                pending_connects: HashMap::new(),
                written: HashMap::new(),
                fail_write_after: None,
                rssi_failure: None,
                disconnect_failure: None,
                disconnect_stalled: false,
                connect_attempts: 0,
                rssi_reads: 0,
                rssi_reads_while_disconnected: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a peripheral; it advertises when a scan starts
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        let mut state = self.lock();
        let id = peripheral.peripheral.id.clone();
        state.peripherals.insert(id.clone(), peripheral);
        if state.scanning {
            advertise_locked(&state, &id);
        }
    }

    /// Send another advertisement for a registered peripheral
    pub fn advertise(&self, peripheral: &PeripheralId) {
        let state = self.lock();
        if state.scanning {
            advertise_locked(&state, peripheral);
        }
    }

    /// Replace the advertised name of a registered peripheral and advertise it
    pub fn rename(&self, peripheral: &PeripheralId, name: &str) {
        let mut state = self.lock();
        if let Some(sim) = state.peripherals.get_mut(peripheral) {
            sim.peripheral.name = Some(name.to_string());
        }
        if state.scanning {
            advertise_locked(&state, peripheral);
        }
    }

    /// Report a peripheral as out of range
    pub fn lose(&self, peripheral: &PeripheralId) {
        let state = self.lock();
        state.emit(PlatformEvent::PeripheralLost(peripheral.clone()));
    }

    /// Drop a link, or one still being set up, without being asked to
    pub fn drop_link(&self, peripheral: &PeripheralId) {
        let mut state = self.lock();
        let connecting = state.pending_connects.contains_key(peripheral);
        if state.connected.remove(peripheral) || connecting {
            state.subscribed.retain(|(id, _)| id != peripheral);
            state.emit(PlatformEvent::Disconnected(peripheral.clone()));
        }
    }

    /// Push a notification from a subscribed characteristic
    pub fn notify(&self, peripheral: &PeripheralId, characteristic: Uuid, value: &[u8]) {
        let state = self.lock();
        if state
            .subscribed
            .contains(&(peripheral.clone(), characteristic))
        {
            state.emit(PlatformEvent::Notification {
                peripheral: peripheral.clone(),
                characteristic,
                value: value.to_vec(),
            });
        }
    }

    pub fn set_radio_state(&self, radio: RadioState) {
        let mut state = self.lock();
        state.radio = radio;
        if radio != RadioState::Available {
            state.scanning = false;
        }
        state.emit(PlatformEvent::RadioStateChanged(radio));
    }

    /// Fail the write that comes after `successful` more writes
    pub fn fail_write_after(&self, successful: usize) {
        self.lock().fail_write_after = Some(successful);
    }

    pub fn fail_rssi(&self, reason: Option<&str>) {
        self.lock().rssi_failure = reason.map(str::to_string);
    }

    pub fn fail_disconnect(&self, reason: Option<&str>) {
        self.lock().disconnect_failure = reason.map(str::to_string);
    }

    /// Leave disconnect requests unanswered
    pub fn stall_disconnect(&self, stalled: bool) {
        self.lock().disconnect_stalled = stalled;
    }

    pub fn set_rssi(&self, peripheral: &PeripheralId, rssi: i16) {
        if let Some(sim) = self.lock().peripherals.get_mut(peripheral) {
            sim.rssi = rssi;
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    pub fn is_connected(&self, peripheral: &PeripheralId) -> bool {
        self.lock().connected.contains(peripheral)
    }

    /// Every chunk written to a peripheral, in order
    pub fn written_chunks(&self, peripheral: &PeripheralId) -> Vec<Vec<u8>> {
        self.lock()
            .written
            .get(peripheral)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn rssi_reads(&self) -> usize {
        self.lock().rssi_reads
    }

    /// RSSI reads issued for a peripheral without a link
    pub fn rssi_reads_while_disconnected(&self) -> usize {
        self.lock().rssi_reads_while_disconnected
    }

    fn lookup(&self, peripheral: &PeripheralId) -> PlatformResult<SimulatedPeripheral> {
        self.lock()
            .peripherals
            .get(peripheral)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownPeripheral(peripheral.to_string()))
    }

    fn require_link(&self, peripheral: &PeripheralId) -> PlatformResult<()> {
        if self.is_connected(peripheral) {
            Ok(())
        } else {
            Err(PlatformError::NotConnected)
        }
    }
}

fn advertise_locked(state: &SimState, peripheral: &PeripheralId) {
    if let Some(sim) = state.peripherals.get(peripheral) {
        state.emit(PlatformEvent::Discovered(sim.peripheral.clone()));
    }
}

#[async_trait]
impl BlePlatform for SimulatedPlatform {
    async fn attach(&self, events: PlatformEventSender) -> PlatformResult<()> {
        let mut state = self.lock();
        if state.events.is_some() {
            return Err(PlatformError::Other(
                "platform events already attached".to_string(),
            ));
        }
        state.events = Some(events);
        Ok(())
    }

    async fn radio_state(&self) -> RadioState {
        self.lock().radio
    }

    async fn start_scan(&self, services: &ServiceSet) -> PlatformResult<()> {
        let mut state = self.lock();
        match state.radio {
            RadioState::Available => {}
            RadioState::Unauthorized => return Err(PlatformError::Unauthorized),
            RadioState::PoweredOff | RadioState::Unsupported => {
                return Err(PlatformError::RadioUnavailable)
            }
        }
        state.scanning = true;
        state.scan_filter = services.clone();
        debug!("Simulated scan started");

        // Unfiltered: filtering is the scan session's job.
        let ids: Vec<PeripheralId> = state.peripherals.keys().cloned().collect();
        for id in ids {
            advertise_locked(&state, &id);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> PlatformResult<()> {
        let sim = self.lookup(peripheral)?;
        self.lock().connect_attempts += 1;

        match sim.connect {
            ConnectBehavior::Succeed => {
                self.lock().connected.insert(peripheral.clone());
                Ok(())
            }
            ConnectBehavior::Fail(reason) => Err(PlatformError::Other(reason)),
            ConnectBehavior::Hang => {
                let aborted = Arc::new(Notify::new());
                self.lock()
                    .pending_connects
                    .insert(peripheral.clone(), aborted.clone());
                aborted.notified().await;
                Err(PlatformError::Other("connection attempt aborted".to_string()))
            }
            ConnectBehavior::SucceedAfter(delay) => {
                tokio::time::sleep(delay).await;
                self.lock().connected.insert(peripheral.clone());
                Ok(())
            }
        }
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        services: &ServiceSet,
    ) -> PlatformResult<Vec<CharacteristicInfo>> {
        if let Some(delay) = self.lookup(peripheral)?.discovery_delay {
            tokio::time::sleep(delay).await;
        }
        self.require_link(peripheral)?;
        let sim = self.lookup(peripheral)?;
        if let Some(reason) = sim.discovery_error {
            return Err(PlatformError::Other(reason));
        }
        Ok(sim
            .characteristics
            .into_iter()
            .filter(|c| services.is_empty() || services.contains(&c.service))
            .collect())
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> PlatformResult<()> {
        self.require_link(peripheral)?;
        self.lock()
            .subscribed
            .insert((peripheral.clone(), characteristic.uuid));
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        _characteristic: &CharacteristicInfo,
        data: &[u8],
        _write_type: WriteType,
    ) -> PlatformResult<()> {
        self.require_link(peripheral)?;
        let sim = self.lookup(peripheral)?;

        let mut state = self.lock();
        match state.fail_write_after {
            Some(0) => {
                state.fail_write_after = None;
                return Err(PlatformError::Other("write rejected".to_string()));
            }
            Some(remaining) => state.fail_write_after = Some(remaining - 1),
            None => {}
        }

        state
            .written
            .entry(peripheral.clone())
            .or_default()
            .push(data.to_vec());

        if sim.echo {
            if let Some(notify) = sim.notify_characteristic() {
                if state.subscribed.contains(&(peripheral.clone(), notify.uuid)) {
                    state.emit(PlatformEvent::Notification {
                        peripheral: peripheral.clone(),
                        characteristic: notify.uuid,
                        value: data.to_vec(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn max_write_len(
        &self,
        peripheral: &PeripheralId,
        _write_type: WriteType,
    ) -> Option<usize> {
        self.lock()
            .peripherals
            .get(peripheral)
            .and_then(|sim| sim.max_write_len)
    }

    async fn read_rssi(&self, peripheral: &PeripheralId) -> PlatformResult<i16> {
        let mut state = self.lock();
        state.rssi_reads += 1;
        if !state.connected.contains(peripheral) {
            state.rssi_reads_while_disconnected += 1;
            return Err(PlatformError::NotConnected);
        }
        if let Some(reason) = &state.rssi_failure {
            return Err(PlatformError::Other(reason.clone()));
        }
        state
            .peripherals
            .get(peripheral)
            .map(|sim| sim.rssi)
            .ok_or_else(|| PlatformError::UnknownPeripheral(peripheral.to_string()))
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> PlatformResult<()> {
        let stalled = self.lock().disconnect_stalled;
        if stalled {
            std::future::pending::<()>().await;
        }
        let mut state = self.lock();
        if let Some(pending) = state.pending_connects.remove(peripheral) {
            pending.notify_one();
        }
        if let Some(reason) = &state.disconnect_failure {
            return Err(PlatformError::Other(reason.clone()));
        }
        state.subscribed.retain(|(id, _)| id != peripheral);
        if state.connected.remove(peripheral) {
            state.emit(PlatformEvent::Disconnected(peripheral.clone()));
        }
        Ok(())
    }
}
