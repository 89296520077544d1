//! Connection lifecycle for the transporter's single peripheral

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleSerialConfig;
use crate::error::{BleSerialError, PlatformResult, Result};
use crate::observer::ConnectionObserver;
use crate::peripheral::{ConnectionState, DisconnectReason, Peripheral, PeripheralId};
use crate::platform::BlePlatform;
use crate::protocol::{select_channel, NegotiatedChannel};
use crate::stream::{StreamBridge, StreamPair};
use crate::transport::TaskEvent;

/// Completion for [`connect`](crate::BleSerialTransporter::connect)
pub type ConnectCallback = Box<dyn FnOnce(Result<StreamPair>) + Send>;

/// Completion for [`disconnect`](crate::BleSerialTransporter::disconnect)
pub type DisconnectCallback = Box<dyn FnOnce(Result<()>) + Send>;

struct PendingConnect {
    request: u64,
    on_complete: ConnectCallback,
}

struct PendingDisconnect {
    request: u64,
    on_complete: DisconnectCallback,
}

/// A failed connect waiting for its link to be torn down
struct PendingRelease {
    request: u64,
    on_complete: ConnectCallback,
    error: BleSerialError,
}

// ----------------------------------------------------------------------------
// Connection Controller
// ----------------------------------------------------------------------------

/// Owns the connection state machine.
///
/// Platform operations run on spawned tasks and report back as
/// [`TaskEvent`]s tagged with the request that issued them. A completion
/// whose request is no longer pending is dropped, which is what keeps every
/// callback to a single invocation.
pub(crate) struct ConnectionController {
    config: Arc<BleSerialConfig>,
    platform: Arc<dyn BlePlatform>,
    task_events: mpsc::UnboundedSender<TaskEvent>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    next_request: u64,
    /// Peripheral of the current or last attempted connection
    peripheral: Option<Peripheral>,
    pending_connect: Option<PendingConnect>,
    pending_disconnect: Option<PendingDisconnect>,
    releasing: Option<PendingRelease>,
    bridge: Option<StreamBridge>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    /// Peripheral whose connection just ended and must be discovered again
    stale: Option<PeripheralId>,
}

impl ConnectionController {
    pub fn new(
        config: Arc<BleSerialConfig>,
        platform: Arc<dyn BlePlatform>,
        task_events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            platform,
            task_events,
            state: ConnectionState::Idle,
            state_tx,
            next_request: 0,
            peripheral: None,
            pending_connect: None,
            pending_disconnect: None,
            releasing: None,
            bridge: None,
            observer: None,
            stale: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The peripheral of a link that is up
    pub fn connected_peripheral(&self) -> Option<&PeripheralId> {
        match self.state {
            ConnectionState::Connected => self.peripheral.as_ref().map(|p| &p.id),
            _ => None,
        }
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn ConnectionObserver>>) {
        self.observer = observer;
    }

    /// Take the peripheral that went stale during the last transition
    pub fn take_stale(&mut self) -> Option<PeripheralId> {
        self.stale.take()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state: {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn next_request(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }

    // ------------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------------

    /// Start connecting. `known` tells whether the peripheral came from a
    /// discovery that is still valid.
    pub fn connect(&mut self, peripheral: Peripheral, known: bool, on_complete: ConnectCallback) {
        if !self.state.can_connect() {
            on_complete(Err(BleSerialError::OperationInvalidForState {
                operation: "connect",
                state: self.state,
            }));
            return;
        }
        if !known {
            warn!("Refusing to connect to stale peripheral {}", peripheral.id);
            on_complete(Err(BleSerialError::ConnectionRejected(format!(
                "peripheral {} is stale, scan for it again",
                peripheral.id
            ))));
            return;
        }

        let request = self.next_request();
        info!("Connecting to {} ({})", peripheral.display_name(), peripheral.id);

        let id = peripheral.id.clone();
        self.peripheral = Some(peripheral);
        self.pending_connect = Some(PendingConnect {
            request,
            on_complete,
        });
        self.set_state(ConnectionState::Connecting);

        let platform = self.platform.clone();
        let events = self.task_events.clone();
        tokio::spawn(async move {
            let result = platform.connect(&id).await;
            let _ = events.send(TaskEvent::PlatformConnected {
                request,
                peripheral: id,
                result,
            });
        });

        self.schedule(
            self.config.connection_timeout,
            TaskEvent::ConnectTimedOut { request },
        );
    }

    /// Platform answered the connect request
    pub fn on_platform_connected(
        &mut self,
        request: u64,
        peripheral: PeripheralId,
        result: PlatformResult<()>,
    ) {
        if !self.is_pending_connect(request) || self.state != ConnectionState::Connecting {
            debug!("Dropping stale connect completion (request {})", request);
            if result.is_ok() {
                self.release_orphan(peripheral);
            }
            return;
        }

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::DiscoveringServices);
                self.spawn_negotiation(request);
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
                self.fail_connect(BleSerialError::ConnectionRejected(e.to_string()));
            }
        }
    }

    fn spawn_negotiation(&self, request: u64) {
        let Some(peripheral) = self.peripheral.as_ref() else {
            return;
        };
        let id = peripheral.id.clone();
        let platform = self.platform.clone();
        let config = self.config.clone();
        let events = self.task_events.clone();

        tokio::spawn(async move {
            let result = negotiate(platform.as_ref(), &id, &config).await;
            let _ = events.send(TaskEvent::ChannelReady {
                request,
                peripheral: id,
                result,
            });
        });
    }

    /// Characteristic discovery and subscription finished
    pub fn on_channel_ready(
        &mut self,
        request: u64,
        peripheral: PeripheralId,
        result: Result<NegotiatedChannel>,
    ) {
        if !self.is_pending_connect(request)
            || self.state != ConnectionState::DiscoveringServices
        {
            debug!("Dropping stale discovery completion (request {})", request);
            if result.is_ok() {
                self.release_orphan(peripheral);
            }
            return;
        }

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to set up serial channel: {}", e);
                self.fail_connect(e);
                return;
            }
        };

        let Some(peripheral) = self.peripheral.as_ref() else {
            return;
        };
        info!(
            "Connected to {}: notify {}, write {} ({} byte chunks)",
            peripheral.id, channel.notify.uuid, channel.write.uuid, channel.max_write_size
        );

        let (bridge, streams) =
            StreamBridge::new(self.platform.clone(), peripheral.id.clone(), channel);
        self.bridge = Some(bridge);
        self.set_state(ConnectionState::Connected);

        if let Some(pending) = self.pending_connect.take() {
            (pending.on_complete)(Ok(streams));
        }
    }

    pub fn on_connect_timeout(&mut self, request: u64) {
        if !self.is_pending_connect(request) {
            return;
        }
        warn!("Connection attempt timed out after {:?}", self.config.connection_timeout);
        self.fail_connect(BleSerialError::ConnectionTimeout);
    }

    fn is_pending_connect(&self, request: u64) -> bool {
        self.pending_connect
            .as_ref()
            .is_some_and(|pending| pending.request == request)
    }

    /// Tear down whatever the attempt brought up, then report `error`.
    ///
    /// The callback fires from [`on_link_released`](Self::on_link_released),
    /// so a retry never races the cleanup disconnect.
    fn fail_connect(&mut self, error: BleSerialError) {
        let Some(pending) = self.pending_connect.take() else {
            return;
        };
        let Some(id) = self.peripheral.as_ref().map(|p| p.id.clone()) else {
            self.set_state(ConnectionState::Disconnected(DisconnectReason::Failed));
            (pending.on_complete)(Err(error));
            return;
        };

        let request = pending.request;
        self.releasing = Some(PendingRelease {
            request,
            on_complete: pending.on_complete,
            error,
        });
        self.set_state(ConnectionState::Disconnecting);

        let platform = self.platform.clone();
        let timeout = self.config.disconnect_timeout;
        let events = self.task_events.clone();
        tokio::spawn(async move {
            release_link(platform, id, timeout).await;
            let _ = events.send(TaskEvent::LinkReleased { request });
        });
    }

    /// The cleanup after a failed connect finished
    pub fn on_link_released(&mut self, request: u64) {
        if !self
            .releasing
            .as_ref()
            .is_some_and(|pending| pending.request == request)
        {
            return;
        }
        let Some(pending) = self.releasing.take() else {
            return;
        };
        self.set_state(ConnectionState::Disconnected(DisconnectReason::Failed));
        (pending.on_complete)(Err(pending.error));
    }

    /// Disconnect a link that came up after its connect was abandoned
    fn release_orphan(&self, id: PeripheralId) {
        let owned = self.state.is_active() && self.peripheral.as_ref().is_some_and(|p| p.id == id);
        if owned {
            return;
        }
        warn!("Releasing link to {} left by an abandoned connect", id);
        tokio::spawn(release_link(
            self.platform.clone(),
            id,
            self.config.disconnect_timeout,
        ));
    }

    // ------------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------------

    /// Tear down the active connection, cancelling a connect in progress
    pub fn disconnect(&mut self, on_complete: DisconnectCallback) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::DiscoveringServices => {
                if let Some(pending) = self.pending_connect.take() {
                    debug!("Cancelling connection attempt (request {})", pending.request);
                    (pending.on_complete)(Err(BleSerialError::Cancelled));
                }
            }
            ConnectionState::Connected => self.close_streams(),
            state => {
                on_complete(Err(BleSerialError::OperationInvalidForState {
                    operation: "disconnect",
                    state,
                }));
                return;
            }
        }

        let Some(id) = self.peripheral.as_ref().map(|p| p.id.clone()) else {
            on_complete(Err(BleSerialError::OperationInvalidForState {
                operation: "disconnect",
                state: self.state,
            }));
            return;
        };

        let request = self.next_request();
        info!("Disconnecting from {}", id);
        self.pending_disconnect = Some(PendingDisconnect {
            request,
            on_complete,
        });
        self.set_state(ConnectionState::Disconnecting);

        let platform = self.platform.clone();
        let events = self.task_events.clone();
        tokio::spawn(async move {
            let result = platform.disconnect(&id).await;
            let _ = events.send(TaskEvent::DisconnectFinished { request, result });
        });

        self.schedule(
            self.config.disconnect_timeout,
            TaskEvent::DisconnectTimedOut { request },
        );
    }

    pub fn on_disconnect_finished(&mut self, request: u64, result: PlatformResult<()>) {
        if !self.is_pending_disconnect(request) {
            debug!("Dropping stale disconnect completion (request {})", request);
            return;
        }

        match result {
            Ok(()) => self.finish_disconnect(),
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                self.fail_disconnect(BleSerialError::DisconnectFailed(e.to_string()));
            }
        }
    }

    pub fn on_disconnect_timeout(&mut self, request: u64) {
        if !self.is_pending_disconnect(request) {
            return;
        }
        warn!("Disconnect not confirmed after {:?}", self.config.disconnect_timeout);
        self.fail_disconnect(BleSerialError::DisconnectFailed(
            "no confirmation from the platform".to_string(),
        ));
    }

    fn is_pending_disconnect(&self, request: u64) -> bool {
        self.pending_disconnect
            .as_ref()
            .is_some_and(|pending| pending.request == request)
    }

    fn finish_disconnect(&mut self) {
        let Some(pending) = self.pending_disconnect.take() else {
            return;
        };
        if let Some(peripheral) = self.peripheral.take() {
            info!("Disconnected from {}", peripheral.id);
            self.stale = Some(peripheral.id);
        }
        self.set_state(ConnectionState::Disconnected(DisconnectReason::Requested));
        (pending.on_complete)(Ok(()));
    }

    fn fail_disconnect(&mut self, error: BleSerialError) {
        let Some(pending) = self.pending_disconnect.take() else {
            return;
        };
        self.set_state(ConnectionState::Disconnected(DisconnectReason::Failed));
        (pending.on_complete)(Err(error));
    }

    // ------------------------------------------------------------------------
    // Platform Events
    // ------------------------------------------------------------------------

    /// The platform reported the link to `id` as down
    pub fn on_peripheral_disconnected(&mut self, id: &PeripheralId) {
        if self.peripheral.as_ref().map(|p| &p.id) != Some(id) {
            return;
        }

        match self.state {
            ConnectionState::Disconnecting => self.finish_disconnect(),
            ConnectionState::Connecting
            | ConnectionState::DiscoveringServices
            | ConnectionState::Connected => self.lose_link(),
            _ => {}
        }
    }

    fn lose_link(&mut self) {
        let Some(peripheral) = self.peripheral.take() else {
            return;
        };
        warn!("Lost connection to {}", peripheral.id);

        self.close_streams();
        self.set_state(ConnectionState::Disconnected(DisconnectReason::Lost));
        self.stale = Some(peripheral.id.clone());

        if let Some(pending) = self.pending_connect.take() {
            (pending.on_complete)(Err(BleSerialError::ConnectionRejected(
                "link lost during connection setup".to_string(),
            )));
        }
        if let Some(observer) = &self.observer {
            observer.on_disconnected(&peripheral);
        }
    }

    pub fn on_notification(&self, id: &PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        if self.peripheral.as_ref().map(|p| &p.id) != Some(id) {
            return;
        }
        if let Some(bridge) = &self.bridge {
            bridge.deliver(characteristic, value);
        }
    }

    fn close_streams(&mut self) {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.close();
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Fail everything pending and drop the link
    pub async fn shutdown(&mut self) {
        if let Some(pending) = self.pending_connect.take() {
            (pending.on_complete)(Err(BleSerialError::Cancelled));
        }
        if let Some(pending) = self.pending_disconnect.take() {
            (pending.on_complete)(Err(BleSerialError::Shutdown));
        }
        let reason = match self.releasing.take() {
            Some(pending) => {
                (pending.on_complete)(Err(pending.error));
                DisconnectReason::Failed
            }
            None => DisconnectReason::Requested,
        };
        self.close_streams();

        let was_linked = self.state.is_active() || self.state == ConnectionState::Disconnecting;
        if let Some(peripheral) = self.peripheral.take() {
            if was_linked {
                release_link(
                    self.platform.clone(),
                    peripheral.id,
                    self.config.disconnect_timeout,
                )
                .await;
                self.set_state(ConnectionState::Disconnected(reason));
            }
        }
    }

    fn schedule(&self, after: Duration, event: TaskEvent) {
        let events = self.task_events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
    }
}

/// Best-effort disconnect that never outlives `timeout`
async fn release_link(platform: Arc<dyn BlePlatform>, id: PeripheralId, timeout: Duration) {
    match tokio::time::timeout(timeout, platform.disconnect(&id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Cleanup disconnect of {} failed: {}", id, e),
        Err(_) => debug!("Cleanup disconnect of {} timed out", id),
    }
}

/// Discover characteristics, pick the serial pair and subscribe to input
async fn negotiate(
    platform: &dyn BlePlatform,
    id: &PeripheralId,
    config: &BleSerialConfig,
) -> Result<NegotiatedChannel> {
    let characteristics = platform
        .discover_characteristics(id, &config.service_uuids)
        .await
        .map_err(|e| BleSerialError::ServiceDiscoveryFailed(e.to_string()))?;

    let mut channel = select_channel(&characteristics, config)?;
    if let Some(len) = platform.max_write_len(id, channel.write_type).await {
        if len > 0 {
            channel.max_write_size = channel.max_write_size.min(len);
        }
    }

    platform.subscribe(id, &channel.notify).await.map_err(|e| {
        BleSerialError::ServiceDiscoveryFailed(format!(
            "failed to subscribe to {}: {}",
            channel.notify.uuid, e
        ))
    })?;

    Ok(channel)
}
