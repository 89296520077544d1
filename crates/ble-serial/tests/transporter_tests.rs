//! Transporter tests against the simulated platform
//!
//! Every test runs with paused time, so timeouts and RSSI intervals advance
//! instantly once all tasks are idle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_serial::platform::CharPropFlags;
use ble_serial::protocol::{SERIAL_SERVICE_FFE0, SERIAL_SERVICE_FFF0};
use ble_serial::{
    BleSerialConfig, BleSerialError, BleSerialTransporter, CharacteristicInfo, ConnectBehavior,
    ConnectionObserver, ConnectionState, DisconnectReason, Peripheral, PeripheralId, RadioState,
    ScanObserver, ScanResult, SignalObserver, SignalSample, SimulatedPeripheral,
    SimulatedPlatform,
};
use tokio::io::AsyncReadExt;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Recorder {
    scans: Mutex<Vec<ScanResult>>,
    scan_errors: Mutex<Vec<BleSerialError>>,
    disconnected: Mutex<Vec<PeripheralId>>,
    samples: Mutex<Vec<i16>>,
    signal_errors: Mutex<usize>,
}

impl Recorder {
    fn latest_scan(&self) -> ScanResult {
        self.scans.lock().unwrap().last().cloned().unwrap_or_default()
    }

    fn peripheral(&self, id: &str) -> Peripheral {
        self.latest_scan()
            .get(&PeripheralId::from(id))
            .cloned()
            .unwrap_or_else(|| panic!("{} was not discovered", id))
    }
}

impl ScanObserver for Recorder {
    fn on_peripherals_updated(&self, peripherals: &ScanResult) {
        self.scans.lock().unwrap().push(peripherals.clone());
    }

    fn on_scan_failed(&self, error: &BleSerialError) {
        self.scan_errors.lock().unwrap().push(error.clone());
    }
}

impl ConnectionObserver for Recorder {
    fn on_disconnected(&self, peripheral: &Peripheral) {
        self.disconnected.lock().unwrap().push(peripheral.id.clone());
    }
}

impl SignalObserver for Recorder {
    fn on_signal_updated(&self, sample: SignalSample) {
        self.samples.lock().unwrap().push(sample.rssi);
    }

    fn on_signal_error(&self, _error: &BleSerialError) {
        *self.signal_errors.lock().unwrap() += 1;
    }
}

fn serial_config() -> BleSerialConfig {
    BleSerialConfig::new().with_services([SERIAL_SERVICE_FFF0])
}

/// Let the transporter task and everything it spawned run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Transporter scanning on a platform with the given peripherals
async fn scanning(
    peripherals: Vec<SimulatedPeripheral>,
    config: BleSerialConfig,
) -> (SimulatedPlatform, BleSerialTransporter, Arc<Recorder>) {
    let platform = SimulatedPlatform::new();
    for peripheral in peripherals {
        platform.add_peripheral(peripheral);
    }
    let transporter = assert_ok!(BleSerialTransporter::spawn(platform.clone(), config).await);
    let recorder = Arc::new(Recorder::default());
    transporter.start_scanning(recorder.clone());
    settle().await;
    (platform, transporter, recorder)
}

fn bare_peripheral(id: &str) -> SimulatedPeripheral {
    SimulatedPeripheral::new(
        Peripheral::new(id)
            .with_name("Bare")
            .with_service(SERIAL_SERVICE_FFF0),
    )
    .with_characteristic(CharacteristicInfo {
        service: SERIAL_SERVICE_FFF0,
        uuid: Uuid::from_u128(0x0000FFF3_0000_1000_8000_00805F9B34FB),
        properties: CharPropFlags::READ,
    })
}

// ----------------------------------------------------------------------------
// Scanning
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_scan_reports_only_matching_services() {
    let other = SimulatedPeripheral::new(
        Peripheral::new("P2")
            .with_name("HM-10")
            .with_service(SERIAL_SERVICE_FFE0),
    );
    let (_platform, _transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII"), other],
        serial_config(),
    )
    .await;

    let latest = recorder.latest_scan();
    assert_eq!(latest.len(), 1);
    assert!(latest.contains(&PeripheralId::from("P1")));
    assert!(!latest.contains(&PeripheralId::from("P2")));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_advertisements_never_duplicate() {
    let (platform, _transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;

    let id = PeripheralId::from("P1");
    platform.advertise(&id);
    platform.advertise(&id);
    platform.rename(&id, "OBDII v2.1");
    settle().await;

    let scans = recorder.scans.lock().unwrap();
    assert_eq!(scans.len(), 4);
    assert!(scans.iter().all(|scan| scan.len() == 1));
    assert_eq!(
        scans[3].get(&id).and_then(|p| p.name.clone()).as_deref(),
        Some("OBDII v2.1")
    );
}

#[tokio::test(start_paused = true)]
async fn test_scan_fails_when_radio_off() {
    let platform = SimulatedPlatform::new();
    platform.set_radio_state(RadioState::PoweredOff);
    let transporter = assert_ok!(BleSerialTransporter::spawn(platform, serial_config()).await);

    let recorder = Arc::new(Recorder::default());
    transporter.start_scanning(recorder.clone());
    settle().await;

    assert_eq!(
        *recorder.scan_errors.lock().unwrap(),
        vec![BleSerialError::RadioUnavailable]
    );
    assert!(recorder.scans.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scan_stops_after_timeout() {
    let (platform, _transporter, _recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config().with_scan_timeout(Duration::from_secs(5)),
    )
    .await;
    assert!(platform.is_scanning());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!platform.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_lost_peripheral_leaves_snapshot() {
    let (platform, _transporter, recorder) = scanning(
        vec![
            SimulatedPeripheral::echo_adapter("P1", "OBDII"),
            SimulatedPeripheral::echo_adapter("P2", "Vlink"),
        ],
        serial_config(),
    )
    .await;
    assert_eq!(recorder.latest_scan().len(), 2);

    platform.lose(&PeripheralId::from("P2"));
    settle().await;

    let latest = recorder.latest_scan();
    assert_eq!(latest.len(), 1);
    assert!(latest.contains(&PeripheralId::from("P1")));
}

// ----------------------------------------------------------------------------
// Connecting
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_connect_delivers_streams() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let mut states = transporter.state_changes();

    let streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    assert!(transporter.is_connected());
    assert_eq!(transporter.state(), ConnectionState::Connected);
    assert_eq!(streams.output.max_write_size(), 20);
    assert_ok!(states.changed().await);
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_platform_write_limit_wins() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_max_write_len(8)],
        serial_config(),
    )
    .await;

    let streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    assert_eq!(streams.output.max_write_size(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_fails_connect() {
    let (platform, transporter, recorder) =
        scanning(vec![bare_peripheral("P3")], serial_config()).await;

    let error = assert_err!(transporter.connect_async(&recorder.peripheral("P3")).await);
    assert_eq!(
        error,
        BleSerialError::RequiredCharacteristicMissing {
            characteristic: "notify".to_string()
        }
    );
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Failed)
    );
    assert!(!platform.is_connected(&PeripheralId::from("P3")));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_failure_fails_connect() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_discovery_error("GATT busy")],
        serial_config(),
    )
    .await;

    let error = assert_err!(transporter.connect_async(&recorder.peripheral("P1")).await);
    assert!(matches!(error, BleSerialError::ServiceDiscoveryFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_platform_refusal_fails_connect() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")
            .with_connect(ConnectBehavior::Fail("refused".to_string()))],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");

    let error = assert_err!(transporter.connect_async(&p1).await);
    assert_eq!(error, BleSerialError::ConnectionRejected("refused".to_string()));

    // A failed attempt does not make the peripheral stale.
    let error = assert_err!(transporter.connect_async(&p1).await);
    assert_eq!(error, BleSerialError::ConnectionRejected("refused".to_string()));
    assert_eq!(platform.connect_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_connect(ConnectBehavior::Hang)],
        serial_config().with_connection_timeout(Duration::from_secs(2)),
    )
    .await;

    let error = assert_err!(transporter.connect_async(&recorder.peripheral("P1")).await);
    assert_eq!(error, BleSerialError::ConnectionTimeout);
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_while_connected_is_rejected() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let _streams = assert_ok!(transporter.connect_async(&p1).await);

    let error = assert_err!(transporter.connect_async(&p1).await);
    assert_eq!(
        error,
        BleSerialError::OperationInvalidForState {
            operation: "connect",
            state: ConnectionState::Connected,
        }
    );
    assert!(transporter.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_requires_fresh_discovery() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let _streams = assert_ok!(transporter.connect_async(&p1).await);
    assert_ok!(transporter.disconnect_async().await);

    let error = assert_err!(transporter.connect_async(&p1).await);
    assert!(matches!(error, BleSerialError::ConnectionRejected(_)));

    // A new scan makes it usable again.
    transporter.stop_scanning();
    transporter.start_scanning(recorder.clone());
    settle().await;
    assert_ok!(transporter.connect_async(&p1).await);
}

// ----------------------------------------------------------------------------
// Disconnecting
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_cancels_it() {
    let (_platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_connect(ConnectBehavior::Hang)],
        serial_config(),
    )
    .await;
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    transporter.connect(&recorder.peripheral("P1"), move |result| {
        log.lock().unwrap().push(format!("connect: {:?}", result.err()));
    });
    let log = events.clone();
    transporter.disconnect(move |result| {
        log.lock().unwrap().push(format!("disconnect: {:?}", result));
    });
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "connect: Some(Cancelled)".to_string(),
            "disconnect: Ok(())".to_string()
        ]
    );
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_that_completes_late_is_released() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")
            .with_connect(ConnectBehavior::SucceedAfter(Duration::from_secs(2)))],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let cancelled = Arc::new(Mutex::new(Vec::new()));

    let log = cancelled.clone();
    transporter.connect(&p1, move |result| {
        log.lock().unwrap().push(result.err());
    });
    settle().await;
    assert_eq!(transporter.state(), ConnectionState::Connecting);

    assert_ok!(transporter.disconnect_async().await);
    assert_eq!(*cancelled.lock().unwrap(), vec![Some(BleSerialError::Cancelled)]);

    // The stack finishes the abandoned connect after the disconnect.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!platform.is_connected(&p1.id));
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
    assert_eq!(cancelled.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_discovery_cancels_it() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")
            .with_discovery_delay(Duration::from_secs(5))],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    transporter.connect(&p1, move |result| {
        log.lock().unwrap().push(format!("connect: {:?}", result.err()));
    });
    settle().await;
    assert_eq!(transporter.state(), ConnectionState::DiscoveringServices);

    let log = events.clone();
    transporter.disconnect(move |result| {
        log.lock().unwrap().push(format!("disconnect: {:?}", result));
    });
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "connect: Some(Cancelled)".to_string(),
            "disconnect: Ok(())".to_string()
        ]
    );
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
    assert!(!platform.is_connected(&p1.id));
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_keeps_task_responsive() {
    let (platform, transporter, recorder) = scanning(
        vec![bare_peripheral("P3")],
        serial_config().with_disconnect_timeout(Duration::from_secs(5)),
    )
    .await;
    platform.stall_disconnect(true);
    let outcome = Arc::new(Mutex::new(Vec::new()));

    let log = outcome.clone();
    transporter.connect(&recorder.peripheral("P3"), move |result| {
        log.lock().unwrap().push(result.err());
    });
    settle().await;

    // Cleanup of the half-open link is under way; requests still get answers.
    assert_eq!(transporter.state(), ConnectionState::Disconnecting);
    let error = assert_err!(transporter.disconnect_async().await);
    assert!(matches!(
        error,
        BleSerialError::OperationInvalidForState { operation: "disconnect", .. }
    ));
    assert!(outcome.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(
        *outcome.lock().unwrap(),
        vec![Some(BleSerialError::RequiredCharacteristicMissing {
            characteristic: "notify".to_string()
        })]
    );
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_idle_is_rejected() {
    let (_platform, transporter, _recorder) = scanning(vec![], serial_config()).await;

    let error = assert_err!(transporter.disconnect_async().await);
    assert_eq!(
        error,
        BleSerialError::OperationInvalidForState {
            operation: "disconnect",
            state: ConnectionState::Idle,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_streams_for_good() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let mut streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);

    assert_ok!(transporter.disconnect_async().await);
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
    assert!(!platform.is_connected(&PeripheralId::from("P1")));

    for _ in 0..5 {
        let mut buf = [0u8; 16];
        assert_eq!(assert_ok!(streams.input.read(&mut buf).await), 0);
        assert_eq!(
            streams.output.write(b"ATZ\r").await,
            Err(BleSerialError::ChannelClosed)
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_failure_is_reported() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let _streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    platform.fail_disconnect(Some("controller busy"));

    let error = assert_err!(transporter.disconnect_async().await);
    assert!(matches!(error, BleSerialError::DisconnectFailed(_)));
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_disconnect_times_out() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config().with_disconnect_timeout(Duration::from_secs(3)),
    )
    .await;
    let _streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    platform.stall_disconnect(true);
    let outcome = Arc::new(Mutex::new(Vec::new()));

    let log = outcome.clone();
    transporter.disconnect(move |result| {
        log.lock().unwrap().push(result);
    });
    settle().await;
    assert_eq!(transporter.state(), ConnectionState::Disconnecting);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let outcome = outcome.lock().unwrap();
    assert_eq!(outcome.len(), 1);
    assert!(matches!(outcome[0], Err(BleSerialError::DisconnectFailed(_))));
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_during_connect_fails_it_once() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_connect(ConnectBehavior::Hang)],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let observer: Arc<dyn ConnectionObserver> = recorder.clone();
    transporter.set_connection_observer(Some(observer));
    let outcome = Arc::new(Mutex::new(Vec::new()));

    let log = outcome.clone();
    transporter.connect(&p1, move |result| {
        log.lock().unwrap().push(result.err());
    });
    settle().await;
    assert_eq!(transporter.state(), ConnectionState::Connecting);

    platform.drop_link(&p1.id);
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        *outcome.lock().unwrap(),
        vec![Some(BleSerialError::ConnectionRejected(
            "link lost during connection setup".to_string()
        ))]
    );
    assert_eq!(*recorder.disconnected.lock().unwrap(), vec![p1.id.clone()]);
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Lost)
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_notifies_and_closes() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let observer: Arc<dyn ConnectionObserver> = recorder.clone();
    transporter.set_connection_observer(Some(observer));
    transporter.start_signal_updates(Duration::from_secs(1), recorder.clone());
    let mut streams = assert_ok!(transporter.connect_async(&p1).await);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(platform.rssi_reads() >= 2);

    platform.drop_link(&p1.id);
    settle().await;

    assert_eq!(*recorder.disconnected.lock().unwrap(), vec![p1.id.clone()]);
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Lost)
    );
    let mut buf = [0u8; 16];
    assert_eq!(assert_ok!(streams.input.read(&mut buf).await), 0);

    // Monitor stopped with the connection.
    let reads = platform.rssi_reads();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(platform.rssi_reads(), reads);
    assert_eq!(platform.rssi_reads_while_disconnected(), 0);

    // The lost peripheral went stale.
    let error = assert_err!(transporter.connect_async(&p1).await);
    assert!(matches!(error, BleSerialError::ConnectionRejected(_)));
}

// ----------------------------------------------------------------------------
// Streams
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_echo_round_trip_reassembles_bytes() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_max_write_len(7)],
        serial_config(),
    )
    .await;
    let mut streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);

    let payload: Vec<u8> = (0..=255u8).cycle().take(300).collect();
    assert_eq!(assert_ok!(streams.output.write(&payload).await), payload.len());

    let mut echoed = vec![0u8; payload.len()];
    assert_ok!(streams.input.read_exact(&mut echoed).await);
    assert_eq!(echoed, payload);

    let chunks = platform.written_chunks(&PeripheralId::from("P1"));
    assert_eq!(chunks.len(), 43);
    assert!(chunks.iter().all(|chunk| chunk.len() <= 7));
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_reports_written_bytes() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config().with_max_write_size(4),
    )
    .await;
    let mut streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    platform.fail_write_after(2);

    let error = assert_err!(streams.output.write(b"0100\r0105\r010C\r").await);
    match error {
        BleSerialError::WriteFailed { written, .. } => assert_eq!(written, 8),
        other => panic!("Expected WriteFailed, got {:?}", other),
    }
}

// ----------------------------------------------------------------------------
// Signal Strength
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_signal_sampling_only_while_connected() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII").with_rssi(-58)],
        serial_config(),
    )
    .await;
    transporter.start_signal_updates(Duration::from_secs(1), recorder.clone());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(platform.rssi_reads(), 0);
    assert_eq!(transporter.signal_strength(), None);

    let _streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let samples = recorder.samples.lock().unwrap().clone();
    assert!(samples.len() >= 3);
    assert!(samples.iter().all(|rssi| *rssi == -58));
    assert_eq!(transporter.signal_strength().map(|s| s.rssi), Some(-58));

    platform.set_rssi(&PeripheralId::from("P1"), -77);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transporter.signal_strength().map(|s| s.rssi), Some(-77));
    assert_eq!(platform.rssi_reads_while_disconnected(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_signal_errors_are_reported() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let _streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);
    platform.fail_rssi(Some("not supported"));

    transporter.start_signal_updates(Duration::from_secs(1), recorder.clone());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(*recorder.signal_errors.lock().unwrap() >= 2);
    assert!(recorder.samples.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_signal_updates_is_idempotent() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let _streams = assert_ok!(transporter.connect_async(&recorder.peripheral("P1")).await);

    transporter.start_signal_updates(Duration::from_secs(1), recorder.clone());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    transporter.stop_signal_updates();
    transporter.stop_signal_updates();
    settle().await;

    let reads = platform.rssi_reads();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(platform.rssi_reads(), reads);
}

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_link_and_rejects_requests() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let mut streams = assert_ok!(transporter.connect_async(&p1).await);

    transporter.shutdown().await;
    assert!(!platform.is_connected(&p1.id));
    assert!(!platform.is_scanning());

    let mut buf = [0u8; 4];
    assert_eq!(assert_ok!(streams.input.read(&mut buf).await), 0);

    let error = assert_err!(transporter.connect_async(&p1).await);
    assert_eq!(error, BleSerialError::Shutdown);

    let rejected = Arc::new(Recorder::default());
    transporter.start_scanning(rejected.clone());
    assert_eq!(
        *rejected.scan_errors.lock().unwrap(),
        vec![BleSerialError::Shutdown]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_shutdowns_both_return() {
    let (platform, transporter, recorder) = scanning(
        vec![SimulatedPeripheral::echo_adapter("P1", "OBDII")],
        serial_config(),
    )
    .await;
    let p1 = recorder.peripheral("P1");
    let _streams = assert_ok!(transporter.connect_async(&p1).await);

    let other = transporter.clone();
    tokio::join!(transporter.shutdown(), other.shutdown());

    assert!(!platform.is_connected(&p1.id));
    assert_eq!(
        transporter.state(),
        ConnectionState::Disconnected(DisconnectReason::Requested)
    );
}
