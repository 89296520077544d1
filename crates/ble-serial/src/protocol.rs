//! GATT constants, service filtering and characteristic selection

use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{CharPropFlags, WriteType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BleSerialConfig;
use crate::error::{BleSerialError, Result};
use crate::platform::CharacteristicInfo;

// ----------------------------------------------------------------------------
// Well-known Service UUIDs
// ----------------------------------------------------------------------------

/// Serial service exposed by most FFF0-family OBD-II adapters
pub const SERIAL_SERVICE_FFF0: Uuid = uuid_from_u16(0xFFF0);

/// Serial service exposed by HM-10 style modules
pub const SERIAL_SERVICE_FFE0: Uuid = uuid_from_u16(0xFFE0);

/// Serial service exposed by some ELM327 clones
pub const SERIAL_SERVICE_18F0: Uuid = uuid_from_u16(0x18F0);

/// Vendor serial service used by Vgate iCar adapters
pub const SERIAL_SERVICE_VGATE: Uuid = Uuid::from_u128(0xE7810A71_73AE_499D_8C15_FAA9AEF0C3F2);

/// Default scan filter
pub const DEFAULT_SERVICE_UUIDS: [Uuid; 4] = [
    SERIAL_SERVICE_FFF0,
    SERIAL_SERVICE_FFE0,
    SERIAL_SERVICE_18F0,
    SERIAL_SERVICE_VGATE,
];

/// ATT payload available with the default 23-byte MTU
pub const DEFAULT_MAX_WRITE_SIZE: usize = 20;

// ----------------------------------------------------------------------------
// Service Filtering
// ----------------------------------------------------------------------------

/// The set of service UUIDs a transporter scans and connects for.
/// An empty set matches every peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSet(Vec<Uuid>);

impl ServiceSet {
    pub fn new(uuids: impl IntoIterator<Item = Uuid>) -> Self {
        let mut set: Vec<Uuid> = Vec::new();
        for uuid in uuids {
            if !set.contains(&uuid) {
                set.push(uuid);
            }
        }
        Self(set)
    }

    pub fn uuids(&self) -> &[Uuid] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.0.contains(uuid)
    }

    /// Whether a peripheral advertising `advertised` passes this filter
    pub fn matches(&self, advertised: &[Uuid]) -> bool {
        self.is_empty() || advertised.iter().any(|uuid| self.contains(uuid))
    }
}

impl FromIterator<Uuid> for ServiceSet {
    fn from_iter<I: IntoIterator<Item = Uuid>>(iter: I) -> Self {
        Self::new(iter)
    }
}

// ----------------------------------------------------------------------------
// Characteristic Selection
// ----------------------------------------------------------------------------

/// The characteristic pair a stream bridge is bound to
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedChannel {
    /// Source of incoming notifications
    pub notify: CharacteristicInfo,
    /// Sink for outgoing writes
    pub write: CharacteristicInfo,
    /// How writes are issued
    pub write_type: WriteType,
    /// Largest payload per write
    pub max_write_size: usize,
}

/// Pick the notify and write characteristics out of a discovery result.
///
/// Configured UUIDs win; otherwise the first characteristic with the needed
/// property inside the configured services is used.
pub fn select_channel(
    characteristics: &[CharacteristicInfo],
    config: &BleSerialConfig,
) -> Result<NegotiatedChannel> {
    let in_scope: Vec<&CharacteristicInfo> = characteristics
        .iter()
        .filter(|c| config.service_uuids.is_empty() || config.service_uuids.contains(&c.service))
        .collect();

    let notify = find_characteristic(
        &in_scope,
        config.notify_characteristic,
        CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
    )
    .ok_or_else(|| BleSerialError::RequiredCharacteristicMissing {
        characteristic: "notify".to_string(),
    })?;

    let write = find_characteristic(
        &in_scope,
        config.write_characteristic,
        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
    )
    .ok_or_else(|| BleSerialError::RequiredCharacteristicMissing {
        characteristic: "write".to_string(),
    })?;

    let write_type = write_type_for(write.properties, config.write_with_response);

    Ok(NegotiatedChannel {
        notify: notify.clone(),
        write: write.clone(),
        write_type,
        max_write_size: config.max_write_size,
    })
}

fn find_characteristic<'a>(
    candidates: &[&'a CharacteristicInfo],
    preferred: Option<Uuid>,
    required: CharPropFlags,
) -> Option<&'a CharacteristicInfo> {
    candidates
        .iter()
        .copied()
        .filter(|c| c.properties.intersects(required))
        .find(|c| preferred.map_or(true, |uuid| c.uuid == uuid))
}

fn write_type_for(properties: CharPropFlags, force_response: bool) -> WriteType {
    if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        && !(force_response && properties.contains(CharPropFlags::WRITE))
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}
