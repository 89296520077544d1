//! Serial byte-stream transport over Bluetooth Low Energy
//!
//! Many BLE serial adapters (ELM327 OBD-II dongles, HM-10 modules) expose a
//! serial port as a pair of GATT characteristics: one that notifies incoming
//! bytes and one that accepts writes. This crate finds such peripherals,
//! connects to one, and hands the caller an [`InputStream`] / [`OutputStream`]
//! pair bound to that characteristic pair.
//!
//! ## Architecture
//!
//! - [`config`] - Transporter configuration
//! - [`error`] - Error types
//! - [`protocol`] - Service UUIDs and characteristic selection
//! - [`peripheral`] - Peripheral identity and connection state
//! - [`platform`] - The BLE central capability and its backends
//! - `discovery` - Scanning and discovery de-duplication
//! - `connection` - Connection state machine
//! - `stream` - Stream pair over notifications and writes
//! - `signal` - RSSI sampling
//! - `transport` - The transporter task and its handle
//!
//! All state lives on one task; [`BleSerialTransporter`] is a cloneable handle
//! that queues requests onto it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ble_serial::{
//!     BleSerialConfig, BleSerialError, BleSerialTransporter, BtleplugPlatform, ScanObserver,
//!     ScanResult,
//! };
//! use tokio::io::AsyncReadExt;
//!
//! struct PrintScan;
//!
//! impl ScanObserver for PrintScan {
//!     fn on_peripherals_updated(&self, peripherals: &ScanResult) {
//!         for p in peripherals {
//!             println!("{} {}", p.id, p.display_name());
//!         }
//!     }
//!
//!     fn on_scan_failed(&self, error: &BleSerialError) {
//!         eprintln!("scan failed: {}", error);
//!     }
//! }
//!
//! # async fn example(adapter: ble_serial::Peripheral) -> Result<(), Box<dyn std::error::Error>> {
//! let platform = BtleplugPlatform::new().await?;
//! let transporter = BleSerialTransporter::spawn(platform, BleSerialConfig::default()).await?;
//! transporter.start_scanning(Arc::new(PrintScan));
//!
//! // Once the adapter shows up in a scan result:
//! let mut streams = transporter.connect_async(&adapter).await?;
//! streams.output.write(b"ATZ\r").await?;
//!
//! let mut reply = [0u8; 64];
//! let n = streams.input.read(&mut reply).await?;
//! println!("{}", String::from_utf8_lossy(&reply[..n]));
//!
//! transporter.disconnect_async().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod connection;
mod discovery;
pub mod error;
mod observer;
pub mod peripheral;
pub mod platform;
pub mod protocol;
mod signal;
mod stream;
mod transport;

// Public API exports
pub use config::BleSerialConfig;
pub use connection::{ConnectCallback, DisconnectCallback};
pub use discovery::ScanResult;
pub use error::{BleSerialError, PlatformError, PlatformResult, Result};
pub use observer::{ConnectionObserver, ScanObserver, SignalObserver};
pub use peripheral::{ConnectionState, DisconnectReason, Peripheral, PeripheralId};
pub use platform::{
    BlePlatform, BtleplugPlatform, CharacteristicInfo, ConnectBehavior, PlatformEvent,
    PlatformEventSender, RadioState, SimulatedPeripheral, SimulatedPlatform,
};
pub use protocol::{ServiceSet, DEFAULT_SERVICE_UUIDS};
pub use signal::SignalSample;
pub use stream::{InputStream, OutputStream, StreamPair};
pub use transport::BleSerialTransporter;
