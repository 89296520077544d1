//! Periodic RSSI sampling of the active connection

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::{BleSerialError, PlatformResult};
use crate::observer::SignalObserver;

/// One RSSI reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSample {
    /// Received signal strength in dBm
    pub rssi: i16,
    pub sampled_at: SystemTime,
}

impl SignalSample {
    pub fn new(rssi: i16) -> Self {
        Self {
            rssi,
            sampled_at: SystemTime::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Signal Monitor
// ----------------------------------------------------------------------------

/// Timer state for RSSI polling.
///
/// The monitor never reads RSSI itself. [`SignalMonitor::on_tick`] tells the
/// owner whether a read should be issued and [`SignalMonitor::on_read`] takes
/// the result back.
pub(crate) struct SignalMonitor {
    ticker: Option<Interval>,
    observer: Option<Arc<dyn SignalObserver>>,
    /// Bumped on every start and stop so late reads can be discarded
    generation: u64,
    read_in_flight: bool,
    latest: watch::Sender<Option<SignalSample>>,
}

impl SignalMonitor {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            ticker: None,
            observer: None,
            generation: 0,
            read_in_flight: false,
            latest,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<SignalSample>> {
        self.latest.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Start sampling, replacing any running interval and observer
    pub fn start(&mut self, interval: Duration, observer: Arc<dyn SignalObserver>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        self.ticker = Some(ticker);
        self.observer = Some(observer);
        self.generation += 1;
        // A read from the previous run may never answer.
        self.read_in_flight = false;
        debug!("Signal strength updates every {:?}", interval);
    }

    /// Stop sampling; idempotent
    pub fn stop(&mut self) {
        if self.ticker.take().is_some() {
            self.observer = None;
            self.generation += 1;
            debug!("Signal strength updates stopped");
        }
    }

    /// Resolves on the next tick; never resolves while stopped
    pub async fn tick(&mut self) {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Decide whether this tick issues a read. Returns the generation to tag
    /// the read with.
    pub fn on_tick(&mut self, connected: bool) -> Option<u64> {
        if !connected {
            trace!("Skipping RSSI tick, not connected");
            return None;
        }
        if self.read_in_flight {
            trace!("Skipping RSSI tick, read still in flight");
            return None;
        }
        self.read_in_flight = true;
        Some(self.generation)
    }

    pub fn on_read(&mut self, generation: u64, result: PlatformResult<i16>) {
        if generation != self.generation {
            trace!("Dropping RSSI result from a previous monitor run");
            return;
        }
        self.read_in_flight = false;

        match result {
            Ok(rssi) => {
                let sample = SignalSample::new(rssi);
                trace!("RSSI {} dBm", rssi);
                self.latest.send_replace(Some(sample));
                if let Some(observer) = &self.observer {
                    observer.on_signal_updated(sample);
                }
            }
            Err(e) => {
                warn!("Failed to read RSSI: {}", e);
                if let Some(observer) = &self.observer {
                    observer.on_signal_error(&BleSerialError::Platform(e));
                }
            }
        }
    }
}
