//! Command handlers for the ble-serial CLI

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use ble_serial::{
    BleSerialConfig, BleSerialError, BleSerialTransporter, BtleplugPlatform, ConnectionObserver,
    InputStream, OutputStream, Peripheral, PeripheralId, ScanObserver, ScanResult, ServiceSet,
    SignalObserver, SignalSample, SimulatedPeripheral, SimulatedPlatform,
};

use crate::cli::{Cli, Commands};
use crate::config::{CliConfig, TerminalConfig};
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Observers
// ----------------------------------------------------------------------------

/// Everything the transporter pushes, funnelled into one channel
#[derive(Debug)]
pub enum TransporterUpdate {
    Peripherals(ScanResult),
    ScanFailed(BleSerialError),
    Disconnected(PeripheralId),
    Signal(SignalSample),
    SignalError(BleSerialError),
}

/// Observer that forwards every callback as a [`TransporterUpdate`]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<TransporterUpdate>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransporterUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, update: TransporterUpdate) {
        if self.tx.send(update).is_err() {
            debug!("Update receiver dropped");
        }
    }
}

impl ScanObserver for ChannelObserver {
    fn on_peripherals_updated(&self, peripherals: &ScanResult) {
        self.forward(TransporterUpdate::Peripherals(peripherals.clone()));
    }

    fn on_scan_failed(&self, error: &BleSerialError) {
        self.forward(TransporterUpdate::ScanFailed(error.clone()));
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_disconnected(&self, peripheral: &Peripheral) {
        self.forward(TransporterUpdate::Disconnected(peripheral.id.clone()));
    }
}

impl SignalObserver for ChannelObserver {
    fn on_signal_updated(&self, sample: SignalSample) {
        self.forward(TransporterUpdate::Signal(sample));
    }

    fn on_signal_error(&self, error: &BleSerialError) {
        self.forward(TransporterUpdate::SignalError(error.clone()));
    }
}

// ----------------------------------------------------------------------------
// Command Dispatcher
// ----------------------------------------------------------------------------

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, mut config: CliConfig) -> Result<()> {
        if !cli.services.is_empty() {
            config.transporter.service_uuids = ServiceSet::new(cli.services.iter().copied());
        }

        match cli.command {
            Commands::Scan { duration } => {
                let transporter = start_transporter(cli.simulate, config.transporter).await?;
                let result = handle_scan(&transporter, Duration::from_secs(duration)).await;
                transporter.shutdown().await;
                result
            }
            Commands::Connect {
                peripheral,
                scan_timeout,
                rssi_interval,
                hex,
            } => {
                let mut terminal = config.terminal;
                terminal.hex |= hex;
                let transporter = start_transporter(cli.simulate, config.transporter).await?;
                let result = handle_connect(
                    &transporter,
                    &peripheral,
                    Duration::from_secs(scan_timeout),
                    rssi_interval.map(Duration::from_secs),
                    &terminal,
                )
                .await;
                transporter.shutdown().await;
                result
            }
            Commands::Rssi {
                peripheral,
                interval,
                count,
                scan_timeout,
            } => {
                let transporter = start_transporter(cli.simulate, config.transporter).await?;
                let result = handle_rssi(
                    &transporter,
                    &peripheral,
                    Duration::from_secs(scan_timeout),
                    Duration::from_secs(interval.max(1)),
                    count,
                )
                .await;
                transporter.shutdown().await;
                result
            }
            Commands::Config { write } => handle_config(&config, write),
        }
    }
}

/// Spawn a transporter on the radio or on simulated adapters
pub async fn start_transporter(
    simulate: bool,
    config: BleSerialConfig,
) -> Result<BleSerialTransporter> {
    let transporter = if simulate {
        info!("Using simulated BLE adapters");
        BleSerialTransporter::spawn(simulated_platform(), config).await?
    } else {
        let platform = BtleplugPlatform::new().await?;
        BleSerialTransporter::spawn(platform, config).await?
    };
    Ok(transporter)
}

/// Two loopback adapters on the common serial services
pub fn simulated_platform() -> SimulatedPlatform {
    let platform = SimulatedPlatform::new();
    platform.add_peripheral(SimulatedPeripheral::echo_adapter("SIM-OBDII", "OBDII").with_rssi(-54));
    platform.add_peripheral(
        SimulatedPeripheral::echo_adapter("SIM-VLINK", "V-LINK")
            .with_rssi(-71)
            .with_max_write_len(64),
    );
    platform
}

// ----------------------------------------------------------------------------
// Scan
// ----------------------------------------------------------------------------

async fn handle_scan(transporter: &BleSerialTransporter, duration: Duration) -> Result<()> {
    info!("Scanning for {}s...", duration.as_secs());
    let (observer, mut updates) = ChannelObserver::new();
    transporter.start_scanning(observer);

    let deadline = Instant::now() + duration;
    let mut seen = HashSet::new();
    let mut latest = ScanResult::default();

    while let Ok(Some(update)) = timeout_at(deadline, updates.recv()).await {
        match update {
            TransporterUpdate::Peripherals(result) => {
                for peripheral in result.iter() {
                    if seen.insert(peripheral.id.clone()) {
                        println!("+ {}", describe(peripheral));
                    }
                }
                latest = result;
            }
            TransporterUpdate::ScanFailed(error) => return Err(CliError::ScanFailed(error)),
            _ => {}
        }
    }
    transporter.stop_scanning();

    println!("\n{} peripheral(s) found", latest.len());
    for peripheral in latest.iter() {
        println!("  {}", describe(peripheral));
    }
    Ok(())
}

fn describe(peripheral: &Peripheral) -> String {
    match peripheral.rssi {
        Some(rssi) => format!(
            "{} [{}] {} dBm",
            peripheral.display_name(),
            peripheral.id,
            rssi
        ),
        None => format!("{} [{}]", peripheral.display_name(), peripheral.id),
    }
}

/// Scan until `wanted` (identifier or name) shows up
pub async fn find_peripheral(
    transporter: &BleSerialTransporter,
    wanted: &str,
    scan_timeout: Duration,
) -> Result<Peripheral> {
    info!("Looking for {}...", wanted);
    let (observer, mut updates) = ChannelObserver::new();
    transporter.start_scanning(observer);

    let deadline = Instant::now() + scan_timeout;
    let found = loop {
        match timeout_at(deadline, updates.recv()).await {
            Ok(Some(TransporterUpdate::Peripherals(result))) => {
                let hit = result
                    .iter()
                    .find(|p| p.id.as_str() == wanted || p.name.as_deref() == Some(wanted));
                if let Some(peripheral) = hit {
                    break Ok(peripheral.clone());
                }
            }
            Ok(Some(TransporterUpdate::ScanFailed(error))) => break Err(CliError::ScanFailed(error)),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                break Err(CliError::PeripheralNotFound {
                    peripheral: wanted.to_string(),
                    seconds: scan_timeout.as_secs(),
                })
            }
        }
    };

    transporter.stop_scanning();
    found
}

// ----------------------------------------------------------------------------
// Connect
// ----------------------------------------------------------------------------

async fn handle_connect(
    transporter: &BleSerialTransporter,
    wanted: &str,
    scan_timeout: Duration,
    rssi_interval: Option<Duration>,
    terminal: &TerminalConfig,
) -> Result<()> {
    let peripheral = find_peripheral(transporter, wanted, scan_timeout).await?;
    let streams = transporter.connect_async(&peripheral).await?;
    info!(
        "Connected to {}, type to send, Ctrl-D or Ctrl-C to quit",
        peripheral.display_name()
    );

    let (observer, mut updates) = ChannelObserver::new();
    let link_observer: Arc<dyn ConnectionObserver> = observer.clone();
    transporter.set_connection_observer(Some(link_observer));
    if let Some(interval) = rssi_interval {
        transporter.start_signal_updates(interval, observer);
    }

    let (input, output) = streams.into_split();
    let printer = tokio::spawn(print_input(input, terminal.hex));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let session = send_lines(&mut lines, output, terminal);
    tokio::pin!(session);

    let link_lost = loop {
        tokio::select! {
            result = &mut session => {
                result?;
                break false;
            }
            update = updates.recv() => match update {
                Some(TransporterUpdate::Disconnected(id)) => {
                    warn!("Connection to {} lost", id);
                    break true;
                }
                Some(TransporterUpdate::Signal(sample)) => info!("RSSI {} dBm", sample.rssi),
                Some(TransporterUpdate::SignalError(error)) => debug!("RSSI unavailable: {}", error),
                Some(_) => {}
                None => break true,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break false;
            }
        }
    };

    if !link_lost {
        transporter.disconnect_async().await?;
    }
    match printer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Reading from {} failed: {}", peripheral.display_name(), e),
        Err(e) => debug!("Input printer ended abnormally: {}", e),
    }
    Ok(())
}

/// Forward stdin lines to the peripheral until stdin closes
async fn send_lines<R>(
    lines: &mut tokio::io::Lines<R>,
    mut output: OutputStream,
    terminal: &TerminalConfig,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let bytes = encode_line(&line, terminal)?;
        if bytes.is_empty() {
            continue;
        }
        output.write(&bytes).await?;
    }
    Ok(())
}

/// Bytes to send for one line of terminal input
pub fn encode_line(line: &str, terminal: &TerminalConfig) -> Result<Vec<u8>> {
    if terminal.hex {
        let compact: String = line.split_whitespace().collect();
        return Ok(hex::decode(compact)?);
    }
    let mut bytes = line.as_bytes().to_vec();
    bytes.extend_from_slice(terminal.line_ending.as_bytes());
    Ok(bytes)
}

/// Copy everything the peripheral sends to stdout until the link closes
async fn print_input(mut input: InputStream, hex_output: bool) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 512];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if hex_output {
            stdout
                .write_all(format!("{}\n", hex::encode(&buf[..n])).as_bytes())
                .await?;
        } else {
            // Adapters end lines with CR only.
            let text = String::from_utf8_lossy(&buf[..n]).replace('\r', "\n");
            stdout.write_all(text.as_bytes()).await?;
        }
        stdout.flush().await?;
    }
}

// ----------------------------------------------------------------------------
// RSSI
// ----------------------------------------------------------------------------

async fn handle_rssi(
    transporter: &BleSerialTransporter,
    wanted: &str,
    scan_timeout: Duration,
    interval: Duration,
    count: Option<usize>,
) -> Result<()> {
    let peripheral = find_peripheral(transporter, wanted, scan_timeout).await?;
    let _streams = transporter.connect_async(&peripheral).await?;

    let (observer, mut updates) = ChannelObserver::new();
    let link_observer: Arc<dyn ConnectionObserver> = observer.clone();
    transporter.set_connection_observer(Some(link_observer));
    transporter.start_signal_updates(interval, observer);

    let mut samples = 0;
    let link_lost = loop {
        if count.is_some_and(|count| samples >= count) {
            break false;
        }
        tokio::select! {
            update = updates.recv() => match update {
                Some(TransporterUpdate::Signal(sample)) => {
                    samples += 1;
                    println!("{} {} dBm", peripheral.display_name(), sample.rssi);
                }
                Some(TransporterUpdate::SignalError(error)) => warn!("RSSI read failed: {}", error),
                Some(TransporterUpdate::Disconnected(_)) | None => break true,
                Some(_) => {}
            },
            _ = tokio::signal::ctrl_c() => break false,
        }
    };

    transporter.stop_signal_updates();
    if link_lost {
        warn!("Connection to {} lost", peripheral.display_name());
    } else {
        transporter.disconnect_async().await?;
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Config
// ----------------------------------------------------------------------------

fn handle_config(config: &CliConfig, write: bool) -> Result<()> {
    print!("{}", config.to_toml()?);
    if write {
        let path = CliConfig::default_config_path()
            .ok_or_else(|| CliError::Config("no configuration directory".to_string()))?;
        config.save_to_file(&path)?;
        info!("Configuration written to {}", path.display());
    }
    Ok(())
}
