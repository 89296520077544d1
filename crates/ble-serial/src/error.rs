//! Error types for the BLE serial transporter

use thiserror::Error;

use crate::peripheral::ConnectionState;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced to transporter callers through callbacks, observers and
/// stream results
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BleSerialError {
    #[error("Bluetooth radio is not available")]
    RadioUnavailable,

    #[error("Bluetooth access is not authorized")]
    Unauthorized,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Failed to discover services: {0}")]
    ServiceDiscoveryFailed(String),

    #[error("Required {characteristic} characteristic not found")]
    RequiredCharacteristicMissing { characteristic: String },

    #[error("Failed to write to characteristic after {written} bytes: {reason}")]
    WriteFailed { written: usize, reason: String },

    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),

    #[error("Cannot {operation} while {state}")]
    OperationInvalidForState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Stream channel closed")]
    ChannelClosed,

    #[error("Transporter has shut down")]
    Shutdown,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

/// Errors reported by a [`BlePlatform`](crate::BlePlatform) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("BLE adapter not available")]
    RadioUnavailable,

    #[error("Permission denied")]
    Unauthorized,

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Platform operation timed out")]
    TimedOut,

    #[error("{0}")]
    Other(String),
}

impl From<btleplug::Error> for PlatformError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::PermissionDenied => PlatformError::Unauthorized,
            btleplug::Error::NotConnected => PlatformError::NotConnected,
            btleplug::Error::DeviceNotFound => {
                PlatformError::UnknownPeripheral("device not found".to_string())
            }
            btleplug::Error::TimedOut(_) => PlatformError::TimedOut,
            other => PlatformError::Other(other.to_string()),
        }
    }
}

/// Result type for transporter operations
pub type Result<T> = std::result::Result<T, BleSerialError>;

/// Result type for platform operations
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

impl From<BleSerialError> for std::io::Error {
    fn from(err: BleSerialError) -> Self {
        let kind = match err {
            BleSerialError::ChannelClosed => std::io::ErrorKind::BrokenPipe,
            BleSerialError::ConnectionTimeout => std::io::ErrorKind::TimedOut,
            BleSerialError::Unauthorized => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
