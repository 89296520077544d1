//! ble-serial CLI library
//!
//! Command-line front end for the `ble-serial` transporter: scanning for
//! serial adapters, an interactive terminal over the byte streams and RSSI
//! sampling.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{CliConfig, LineEnding, TerminalConfig};
pub use error::{CliError, Result};
