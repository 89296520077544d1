//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Use simulated echo adapters instead of the Bluetooth radio
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Service UUID to scan for (repeatable, replaces the configured set)
    #[arg(long = "service", global = true)]
    pub services: Vec<Uuid>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List serial adapters in range
    Scan {
        /// Seconds to scan for
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
    /// Open a serial terminal to a peripheral
    Connect {
        /// Peripheral identifier or advertised name
        peripheral: String,
        /// Seconds to look for the peripheral before giving up
        #[arg(long, default_value_t = 10)]
        scan_timeout: u64,
        /// Log RSSI every N seconds while connected
        #[arg(long)]
        rssi_interval: Option<u64>,
        /// Send hex-encoded input lines and print received bytes as hex
        #[arg(long)]
        hex: bool,
    },
    /// Sample the signal strength of a peripheral
    Rssi {
        /// Peripheral identifier or advertised name
        peripheral: String,
        /// Seconds between samples
        #[arg(short, long, default_value_t = 1)]
        interval: u64,
        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Seconds to look for the peripheral before giving up
        #[arg(long, default_value_t = 10)]
        scan_timeout: u64,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the default configuration path
        #[arg(long)]
        write: bool,
    },
}
