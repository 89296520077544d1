//! Observer traits for pushed transporter updates
//!
//! Observers are called on the transporter task. Implementations should hand
//! work off (channel send, atomic store) rather than block.

use crate::discovery::ScanResult;
use crate::error::BleSerialError;
use crate::peripheral::Peripheral;
use crate::signal::SignalSample;

/// Receives scan snapshots
pub trait ScanObserver: Send + Sync {
    /// Called with every currently known peripheral after each discovery
    fn on_peripherals_updated(&self, peripherals: &ScanResult);

    /// Scanning could not start or had to end (radio off, no permission)
    fn on_scan_failed(&self, error: &BleSerialError);
}

/// Receives unsolicited link loss
pub trait ConnectionObserver: Send + Sync {
    fn on_disconnected(&self, peripheral: &Peripheral);
}

/// Receives RSSI samples for the active connection
pub trait SignalObserver: Send + Sync {
    fn on_signal_updated(&self, sample: SignalSample);

    fn on_signal_error(&self, _error: &BleSerialError) {}
}
