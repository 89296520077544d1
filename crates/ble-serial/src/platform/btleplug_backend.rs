//! `btleplug` backed platform

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures::stream::{Stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{BlePlatform, CharacteristicInfo, PlatformEvent, PlatformEventSender, RadioState};
use crate::error::{PlatformError, PlatformResult};
use crate::peripheral::{Peripheral, PeripheralId};
use crate::protocol::ServiceSet;

type PeripheralMap = Arc<RwLock<HashMap<PeripheralId, PlatformPeripheral>>>;

// ----------------------------------------------------------------------------
// Btleplug Platform
// ----------------------------------------------------------------------------

/// Platform backend driving the first adapter reported by `btleplug`
pub struct BtleplugPlatform {
    adapter: Adapter,
    /// Platform handles of every peripheral seen since attach
    peripherals: PeripheralMap,
    events: OnceLock<PlatformEventSender>,
    /// Notification forwarders, one per subscribed peripheral
    forwarders: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
}

impl BtleplugPlatform {
    /// Open the first available BLE adapter
    pub async fn new() -> PlatformResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PlatformError::RadioUnavailable)?;

        info!("BLE adapter initialized");
        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            events: OnceLock::new(),
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    async fn handle(&self, peripheral: &PeripheralId) -> PlatformResult<PlatformPeripheral> {
        self.peripherals
            .read()
            .await
            .get(peripheral)
            .cloned()
            .ok_or_else(|| PlatformError::UnknownPeripheral(peripheral.to_string()))
    }

    fn event_sender(&self) -> PlatformResult<PlatformEventSender> {
        self.events
            .get()
            .cloned()
            .ok_or_else(|| PlatformError::Other("platform events not attached".to_string()))
    }

    async fn stop_forwarding(&self, peripheral: &PeripheralId) {
        if let Some(task) = self.forwarders.lock().await.remove(peripheral) {
            task.abort();
        }
    }
}

#[async_trait]
impl BlePlatform for BtleplugPlatform {
    async fn attach(&self, events: PlatformEventSender) -> PlatformResult<()> {
        if self.events.set(events.clone()).is_err() {
            return Err(PlatformError::Other(
                "platform events already attached".to_string(),
            ));
        }

        let central_events = self.adapter.events().await?;
        tokio::spawn(forward_central_events(
            self.adapter.clone(),
            central_events,
            self.peripherals.clone(),
            events,
        ));
        Ok(())
    }

    async fn radio_state(&self) -> RadioState {
        match self.adapter.adapter_info().await {
            Ok(info) => {
                debug!("Using BLE adapter {}", info);
                RadioState::Available
            }
            Err(btleplug::Error::PermissionDenied) => RadioState::Unauthorized,
            Err(btleplug::Error::NotSupported(_)) => RadioState::Unsupported,
            Err(e) => {
                warn!("BLE adapter unavailable: {}", e);
                RadioState::PoweredOff
            }
        }
    }

    async fn start_scan(&self, services: &ServiceSet) -> PlatformResult<()> {
        let scan_filter = ScanFilter {
            services: services.uuids().to_vec(),
        };
        self.adapter.start_scan(scan_filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> PlatformResult<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> PlatformResult<()> {
        let handle = self.handle(peripheral).await?;
        handle.connect().await?;
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        services: &ServiceSet,
    ) -> PlatformResult<Vec<CharacteristicInfo>> {
        let handle = self.handle(peripheral).await?;
        handle.discover_services().await?;

        let characteristics = handle
            .services()
            .into_iter()
            .filter(|service| services.is_empty() || services.contains(&service.uuid))
            .flat_map(|service| service.characteristics.into_iter())
            .map(|c| CharacteristicInfo {
                service: c.service_uuid,
                uuid: c.uuid,
                properties: c.properties,
            })
            .collect::<Vec<_>>();

        debug!(
            "Discovered {} characteristics on {}",
            characteristics.len(),
            peripheral
        );
        Ok(characteristics)
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> PlatformResult<()> {
        let handle = self.handle(peripheral).await?;
        let target = find_characteristic(&handle, characteristic)?;
        handle.subscribe(&target).await?;

        let sink = self.event_sender()?;
        let notifications = handle.notifications().await?;
        let peripheral_id = peripheral.clone();
        let task = tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(data) = notifications.next().await {
                let event = PlatformEvent::Notification {
                    peripheral: peripheral_id.clone(),
                    characteristic: data.uuid,
                    value: data.value,
                };
                if sink.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification handler for {} ended", peripheral_id);
        });

        if let Some(previous) = self.forwarders.lock().await.insert(peripheral.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> PlatformResult<()> {
        let handle = self.handle(peripheral).await?;
        let target = find_characteristic(&handle, characteristic)?;
        handle.write(&target, data, write_type).await?;
        Ok(())
    }

    async fn read_rssi(&self, peripheral: &PeripheralId) -> PlatformResult<i16> {
        let handle = self.handle(peripheral).await?;
        handle
            .properties()
            .await?
            .and_then(|properties| properties.rssi)
            .ok_or_else(|| PlatformError::Other("RSSI not reported".to_string()))
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> PlatformResult<()> {
        self.stop_forwarding(peripheral).await;
        let handle = self.handle(peripheral).await?;
        handle.disconnect().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Event Forwarding
// ----------------------------------------------------------------------------

async fn forward_central_events(
    adapter: Adapter,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    peripherals: PeripheralMap,
    sink: PlatformEventSender,
) {
    while let Some(event) = events.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                match adapter.peripheral(&id).await {
                    Ok(handle) => {
                        let discovered = describe(&handle).await;
                        peripherals
                            .write()
                            .await
                            .insert(discovered.id.clone(), handle);
                        Some(PlatformEvent::Discovered(discovered))
                    }
                    Err(e) => {
                        trace!("Dropping advertisement from vanished peripheral: {}", e);
                        None
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => Some(PlatformEvent::Disconnected(
                PeripheralId::new(id.to_string()),
            )),
            _ => None,
        };

        if let Some(event) = forwarded {
            if sink.send(event).is_err() {
                debug!("Platform event receiver dropped, stopping adapter event forwarding");
                break;
            }
        }
    }
}

async fn describe(handle: &PlatformPeripheral) -> Peripheral {
    let mut peripheral = Peripheral::new(PeripheralId::new(handle.id().to_string()));
    if let Ok(Some(properties)) = handle.properties().await {
        peripheral.name = properties.local_name;
        peripheral.services = properties.services;
        peripheral.rssi = properties.rssi;
    }
    peripheral
}

fn find_characteristic(
    handle: &PlatformPeripheral,
    wanted: &CharacteristicInfo,
) -> PlatformResult<Characteristic> {
    handle
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == wanted.uuid && c.service_uuid == wanted.service)
        .ok_or_else(|| PlatformError::Other(format!("characteristic {} not found", wanted.uuid)))
}
