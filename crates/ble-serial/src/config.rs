//! BLE serial transporter configuration

use std::time::Duration;

use uuid::Uuid;

use crate::error::{BleSerialError, Result};
use crate::peripheral::PeripheralId;
use crate::protocol::{ServiceSet, DEFAULT_MAX_WRITE_SIZE, DEFAULT_SERVICE_UUIDS};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a BLE serial transporter.
///
/// Fixed for the lifetime of a transporter instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleSerialConfig {
    /// Services to scan for and to discover characteristics in
    pub service_uuids: ServiceSet,
    /// Only report this peripheral while scanning
    pub target_peripheral: Option<PeripheralId>,
    /// Notify characteristic to bind the input stream to
    pub notify_characteristic: Option<Uuid>,
    /// Write characteristic to bind the output stream to
    pub write_characteristic: Option<Uuid>,
    /// Maximum time from connect request to a ready stream pair
    pub connection_timeout: Duration,
    /// Maximum time to wait for a disconnect confirmation
    pub disconnect_timeout: Duration,
    /// Stop scanning on its own after this long
    pub scan_timeout: Option<Duration>,
    /// Largest payload per characteristic write when the platform reports none
    pub max_write_size: usize,
    /// Use write-with-response even when write-without-response is available
    pub write_with_response: bool,
}

impl Default for BleSerialConfig {
    fn default() -> Self {
        Self {
            service_uuids: ServiceSet::new(DEFAULT_SERVICE_UUIDS),
            target_peripheral: None,
            notify_characteristic: None,
            write_characteristic: None,
            connection_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            scan_timeout: None,
            max_write_size: DEFAULT_MAX_WRITE_SIZE,
            write_with_response: false,
        }
    }
}

impl BleSerialConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the service UUIDs to scan for
    pub fn with_services(mut self, services: impl IntoIterator<Item = Uuid>) -> Self {
        self.service_uuids = ServiceSet::new(services);
        self
    }

    /// Restrict scanning to a single peripheral
    pub fn with_target_peripheral(mut self, peripheral: PeripheralId) -> Self {
        self.target_peripheral = Some(peripheral);
        self
    }

    /// Bind the input stream to a specific characteristic
    pub fn with_notify_characteristic(mut self, uuid: Uuid) -> Self {
        self.notify_characteristic = Some(uuid);
        self
    }

    /// Bind the output stream to a specific characteristic
    pub fn with_write_characteristic(mut self, uuid: Uuid) -> Self {
        self.write_characteristic = Some(uuid);
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set disconnect timeout
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set scan timeout
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = Some(timeout);
        self
    }

    /// Set maximum write size
    pub fn with_max_write_size(mut self, size: usize) -> Self {
        self.max_write_size = size;
        self
    }

    /// Force write-with-response
    pub fn with_write_with_response(mut self, enabled: bool) -> Self {
        self.write_with_response = enabled;
        self
    }

    /// Check the configuration before a transporter is built from it
    pub fn validate(&self) -> Result<()> {
        if self.max_write_size == 0 {
            return Err(BleSerialError::InvalidConfiguration(
                "max_write_size must be greater than zero".to_string(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(BleSerialError::InvalidConfiguration(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(BleSerialError::InvalidConfiguration(
                "disconnect_timeout must be greater than zero".to_string(),
            ));
        }
        if self.scan_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BleSerialError::InvalidConfiguration(
                "scan_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BleSerialConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service_uuids.uuids().len(), DEFAULT_SERVICE_UUIDS.len());
        assert_eq!(config.max_write_size, DEFAULT_MAX_WRITE_SIZE);
    }

    #[test]
    fn test_zero_write_size_rejected() {
        let config = BleSerialConfig::new().with_max_write_size(0);
        assert!(matches!(
            config.validate(),
            Err(BleSerialError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_zero_scan_timeout_rejected() {
        let config = BleSerialConfig::new().with_scan_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
