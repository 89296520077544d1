//! Transporter task and its public handle

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::BleSerialConfig;
use crate::connection::{ConnectCallback, ConnectionController, DisconnectCallback};
use crate::discovery::ScanSession;
use crate::error::{BleSerialError, PlatformResult, Result};
use crate::observer::{ConnectionObserver, ScanObserver, SignalObserver};
use crate::peripheral::{ConnectionState, Peripheral, PeripheralId};
use crate::platform::{BlePlatform, PlatformEvent};
use crate::protocol::NegotiatedChannel;
use crate::signal::{SignalMonitor, SignalSample};
use crate::stream::StreamPair;

// ----------------------------------------------------------------------------
// Messages
// ----------------------------------------------------------------------------

/// Requests from a [`BleSerialTransporter`] handle
enum Command {
    StartScanning(Arc<dyn ScanObserver>),
    StopScanning,
    Connect {
        peripheral: Peripheral,
        on_complete: ConnectCallback,
    },
    Disconnect {
        on_complete: DisconnectCallback,
    },
    SetConnectionObserver(Option<Arc<dyn ConnectionObserver>>),
    StartSignalUpdates {
        interval: Duration,
        observer: Arc<dyn SignalObserver>,
    },
    StopSignalUpdates,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

impl Command {
    /// Complete whatever the command carries when the task is gone
    fn reject(self) {
        match self {
            Command::StartScanning(observer) => observer.on_scan_failed(&BleSerialError::Shutdown),
            Command::Connect { on_complete, .. } => on_complete(Err(BleSerialError::Shutdown)),
            Command::Disconnect { on_complete } => on_complete(Err(BleSerialError::Shutdown)),
            Command::StartSignalUpdates { observer, .. } => {
                observer.on_signal_error(&BleSerialError::Shutdown)
            }
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
            Command::StopScanning
            | Command::SetConnectionObserver(_)
            | Command::StopSignalUpdates => {}
        }
    }
}

/// Completions of platform work spawned by the task
pub(crate) enum TaskEvent {
    PlatformConnected {
        request: u64,
        peripheral: PeripheralId,
        result: PlatformResult<()>,
    },
    ChannelReady {
        request: u64,
        peripheral: PeripheralId,
        result: Result<NegotiatedChannel>,
    },
    ConnectTimedOut {
        request: u64,
    },
    LinkReleased {
        request: u64,
    },
    DisconnectFinished {
        request: u64,
        result: PlatformResult<()>,
    },
    DisconnectTimedOut {
        request: u64,
    },
    ScanTimedOut {
        generation: u64,
    },
    RssiRead {
        generation: u64,
        result: PlatformResult<i16>,
    },
}

// ----------------------------------------------------------------------------
// Transporter Handle
// ----------------------------------------------------------------------------

/// Handle to a running BLE serial transporter.
///
/// Cloning is cheap. Every method enqueues a request and returns without
/// waiting; results arrive through the given callback or observer. The
/// transporter stops when [`shutdown`](Self::shutdown) is called or the last
/// handle is dropped.
#[derive(Clone)]
pub struct BleSerialTransporter {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    signal: watch::Receiver<Option<SignalSample>>,
}

impl BleSerialTransporter {
    /// Attach to `platform` and start the transporter task
    pub async fn spawn<P: BlePlatform>(platform: P, config: BleSerialConfig) -> Result<Self> {
        config.validate()?;

        let platform: Arc<dyn BlePlatform> = Arc::new(platform);
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        platform.attach(platform_tx).await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = TransporterTask::new(Arc::new(config), platform, command_rx, platform_rx);
        let handle = Self {
            commands: command_tx,
            state: task.connection.subscribe(),
            signal: task.signal.subscribe(),
        };

        tokio::spawn(task.run());
        Ok(handle)
    }

    fn send(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            tracing::debug!("Transporter task gone, rejecting request");
            command.reject();
        }
    }

    /// Scan for peripherals advertising the configured services
    pub fn start_scanning(&self, observer: Arc<dyn ScanObserver>) {
        self.send(Command::StartScanning(observer));
    }

    pub fn stop_scanning(&self) {
        self.send(Command::StopScanning);
    }

    /// Connect to a peripheral reported by the current scan.
    ///
    /// `on_complete` is called exactly once with the ready stream pair or the
    /// reason the connection could not be set up.
    pub fn connect<F>(&self, peripheral: &Peripheral, on_complete: F)
    where
        F: FnOnce(Result<StreamPair>) + Send + 'static,
    {
        self.send(Command::Connect {
            peripheral: peripheral.clone(),
            on_complete: Box::new(on_complete),
        });
    }

    /// Disconnect the active peripheral, cancelling a connect in progress
    pub fn disconnect<F>(&self, on_complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.send(Command::Disconnect {
            on_complete: Box::new(on_complete),
        });
    }

    /// [`connect`](Self::connect) as a future
    pub async fn connect_async(&self, peripheral: &Peripheral) -> Result<StreamPair> {
        let (tx, rx) = oneshot::channel();
        self.connect(peripheral, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| BleSerialError::Shutdown)?
    }

    /// [`disconnect`](Self::disconnect) as a future
    pub async fn disconnect_async(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.disconnect(move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| BleSerialError::Shutdown)?
    }

    /// Observer for link loss; `None` removes it
    pub fn set_connection_observer(&self, observer: Option<Arc<dyn ConnectionObserver>>) {
        self.send(Command::SetConnectionObserver(observer));
    }

    /// Sample RSSI every `interval` while connected
    pub fn start_signal_updates(&self, interval: Duration, observer: Arc<dyn SignalObserver>) {
        if interval.is_zero() {
            observer.on_signal_error(&BleSerialError::InvalidConfiguration(
                "signal update interval must be greater than zero".to_string(),
            ));
            return;
        }
        self.send(Command::StartSignalUpdates { interval, observer });
    }

    pub fn stop_signal_updates(&self) {
        self.send(Command::StopSignalUpdates);
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every connection state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Most recent RSSI sample, if any
    pub fn signal_strength(&self) -> Option<SignalSample> {
        *self.signal.borrow()
    }

    /// Stop the transporter and wait for it to release the platform
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        self.send(Command::Shutdown { done });
        let _ = finished.await;
    }
}

// ----------------------------------------------------------------------------
// Transporter Task
// ----------------------------------------------------------------------------

/// Owns every piece of transporter state; the only place it changes
struct TransporterTask {
    config: Arc<BleSerialConfig>,
    platform: Arc<dyn BlePlatform>,
    commands: mpsc::UnboundedReceiver<Command>,
    platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
    task_events: mpsc::UnboundedReceiver<TaskEvent>,
    task_events_tx: mpsc::UnboundedSender<TaskEvent>,
    scan: ScanSession,
    connection: ConnectionController,
    signal: SignalMonitor,
}

impl TransporterTask {
    fn new(
        config: Arc<BleSerialConfig>,
        platform: Arc<dyn BlePlatform>,
        commands: mpsc::UnboundedReceiver<Command>,
        platform_events: mpsc::UnboundedReceiver<PlatformEvent>,
    ) -> Self {
        let (task_events_tx, task_events) = mpsc::unbounded_channel();
        Self {
            scan: ScanSession::new(&config),
            connection: ConnectionController::new(
                config.clone(),
                platform.clone(),
                task_events_tx.clone(),
            ),
            signal: SignalMonitor::new(),
            config,
            platform,
            commands,
            platform_events,
            task_events,
            task_events_tx,
        }
    }

    async fn run(mut self) {
        tracing::info!("BLE serial transporter started");

        let mut shutdown_requested = None;

        loop {
            let was_connected = self.connection.state().is_connected();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if let ControlFlow::Break(done) = self.handle_command(command).await {
                                shutdown_requested = Some(done);
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("All transporter handles dropped");
                            break;
                        }
                    }
                }

                Some(event) = self.platform_events.recv() => {
                    self.handle_platform_event(event);
                }

                Some(event) = self.task_events.recv() => {
                    self.handle_task_event(event).await;
                }

                _ = self.signal.tick() => {
                    self.on_signal_tick();
                }
            }

            if was_connected && !self.connection.state().is_connected() {
                self.signal.stop();
            }
            if let Some(stale) = self.connection.take_stale() {
                self.scan.forget(&stale);
            }
        }

        self.shutdown().await;

        // Fail whatever is still queued.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }

        tracing::info!("BLE serial transporter stopped");
        if let Some(done) = shutdown_requested {
            let _ = done.send(());
        }
    }

    /// Breaks with the acknowledgement sender on shutdown
    async fn handle_command(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::StartScanning(observer) => {
                if let Some(generation) = self.scan.start(observer, self.platform.as_ref()).await {
                    if let Some(timeout) = self.config.scan_timeout {
                        self.schedule(timeout, TaskEvent::ScanTimedOut { generation });
                    }
                }
            }
            Command::StopScanning => self.scan.stop(self.platform.as_ref()).await,
            Command::Connect {
                peripheral,
                on_complete,
            } => {
                let known = self.scan.lookup(&peripheral.id);
                let is_known = known.is_some();
                self.connection
                    .connect(known.unwrap_or(peripheral), is_known, on_complete);
            }
            Command::Disconnect { on_complete } => self.connection.disconnect(on_complete),
            Command::SetConnectionObserver(observer) => self.connection.set_observer(observer),
            Command::StartSignalUpdates { interval, observer } => {
                self.signal.start(interval, observer)
            }
            Command::StopSignalUpdates => self.signal.stop(),
            Command::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn handle_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Discovered(peripheral) => self.scan.on_discovered(peripheral),
            PlatformEvent::PeripheralLost(id) => self.scan.forget(&id),
            PlatformEvent::Disconnected(id) => self.connection.on_peripheral_disconnected(&id),
            PlatformEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => self
                .connection
                .on_notification(&peripheral, characteristic, value),
            PlatformEvent::RadioStateChanged(state) => {
                tracing::debug!("Radio state changed: {:?}", state);
                self.scan.on_radio_state(state);
            }
        }
    }

    async fn handle_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::PlatformConnected {
                request,
                peripheral,
                result,
            } => self
                .connection
                .on_platform_connected(request, peripheral, result),
            TaskEvent::ChannelReady {
                request,
                peripheral,
                result,
            } => self.connection.on_channel_ready(request, peripheral, result),
            TaskEvent::ConnectTimedOut { request } => self.connection.on_connect_timeout(request),
            TaskEvent::LinkReleased { request } => self.connection.on_link_released(request),
            TaskEvent::DisconnectFinished { request, result } => {
                self.connection.on_disconnect_finished(request, result)
            }
            TaskEvent::DisconnectTimedOut { request } => {
                self.connection.on_disconnect_timeout(request)
            }
            TaskEvent::ScanTimedOut { generation } => {
                self.scan.on_timeout(generation, self.platform.as_ref()).await
            }
            TaskEvent::RssiRead { generation, result } => self.signal.on_read(generation, result),
        }
    }

    fn on_signal_tick(&mut self) {
        let Some(peripheral) = self.connection.connected_peripheral().cloned() else {
            self.signal.on_tick(false);
            return;
        };
        let Some(generation) = self.signal.on_tick(true) else {
            return;
        };

        let platform = self.platform.clone();
        let events = self.task_events_tx.clone();
        tokio::spawn(async move {
            let result = platform.read_rssi(&peripheral).await;
            let _ = events.send(TaskEvent::RssiRead { generation, result });
        });
    }

    async fn shutdown(&mut self) {
        self.signal.stop();
        self.scan.stop(self.platform.as_ref()).await;
        self.connection.shutdown().await;
    }

    fn schedule(&self, after: Duration, event: TaskEvent) {
        let events = self.task_events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
    }
}
