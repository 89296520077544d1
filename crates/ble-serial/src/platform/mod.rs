//! Platform Bluetooth capability consumed by the transporter
//!
//! The transporter never talks to an OS Bluetooth stack directly. It drives a
//! [`BlePlatform`] through a small request surface and receives everything the
//! stack pushes (discoveries, link loss, notifications) as [`PlatformEvent`]s
//! on the sender handed over in [`BlePlatform::attach`].
//!
//! - [`BtleplugPlatform`] is the production backend built on `btleplug`.
//! - [`SimulatedPlatform`] is an in-memory backend with scripted peripherals.

mod btleplug_backend;
mod simulated;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use self::btleplug_backend::BtleplugPlatform;
pub use self::simulated::{ConnectBehavior, SimulatedPeripheral, SimulatedPlatform};
pub use btleplug::api::{CharPropFlags, WriteType};

use crate::error::PlatformResult;
use crate::peripheral::{Peripheral, PeripheralId};
use crate::protocol::ServiceSet;

// ----------------------------------------------------------------------------
// Platform Types
// ----------------------------------------------------------------------------

/// Availability of the local Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Available,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

/// A GATT characteristic found during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicInfo {
    /// Service the characteristic belongs to
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Supported operations
    pub properties: CharPropFlags,
}

/// Everything the platform pushes without being asked
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// A peripheral advertised (first sighting or update)
    Discovered(Peripheral),
    /// A peripheral went out of range
    PeripheralLost(PeripheralId),
    /// A peripheral's link went down
    Disconnected(PeripheralId),
    /// A subscribed characteristic changed value
    Notification {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The radio was switched on/off or access changed
    RadioStateChanged(RadioState),
}

/// Sender the platform uses to deliver [`PlatformEvent`]s
pub type PlatformEventSender = mpsc::UnboundedSender<PlatformEvent>;

// ----------------------------------------------------------------------------
// Platform Capability
// ----------------------------------------------------------------------------

/// Abstract BLE central capability.
///
/// Every request resolves on its own; ordering between a request's result and
/// pushed events is not guaranteed.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Start delivering events to `events`
    async fn attach(&self, events: PlatformEventSender) -> PlatformResult<()>;

    async fn radio_state(&self) -> RadioState;

    async fn start_scan(&self, services: &ServiceSet) -> PlatformResult<()>;

    async fn stop_scan(&self) -> PlatformResult<()>;

    async fn connect(&self, peripheral: &PeripheralId) -> PlatformResult<()>;

    /// Discover the characteristics of `services` (all services when empty)
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        services: &ServiceSet,
    ) -> PlatformResult<Vec<CharacteristicInfo>>;

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> PlatformResult<()>;

    async fn write(
        &self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicInfo,
        data: &[u8],
        write_type: WriteType,
    ) -> PlatformResult<()>;

    /// Largest payload a single write may carry, when the stack knows it
    async fn max_write_len(
        &self,
        _peripheral: &PeripheralId,
        _write_type: WriteType,
    ) -> Option<usize> {
        None
    }

    async fn read_rssi(&self, peripheral: &PeripheralId) -> PlatformResult<i16>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> PlatformResult<()>;
}
