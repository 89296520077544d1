//! Error handling for the ble-serial CLI

use thiserror::Error;

use ble_serial::{BleSerialError, PlatformError};

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Transporter error: {0}")]
    Transporter(#[from] BleSerialError),

    #[error("Bluetooth adapter error: {0}")]
    Adapter(#[from] PlatformError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Peripheral {peripheral} not found within {seconds}s")]
    PeripheralNotFound { peripheral: String, seconds: u64 },

    #[error("Scan failed: {0}")]
    ScanFailed(BleSerialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;
