//! ble-serial CLI configuration
//!
//! Loaded from a TOML file with two sections:
//!
//! ```toml
//! [transporter]
//! service_uuids = ["0000fff0-0000-1000-8000-00805f9b34fb"]
//! max_write_size = 20
//!
//! [terminal]
//! line_ending = "cr"
//! hex = false
//! ```
//!
//! The file is read from `--config` when given, otherwise from
//! `<config dir>/ble-serial/config.toml` if it exists. Missing keys fall back
//! to their defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ble_serial::BleSerialConfig;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Application Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Transporter settings
    pub transporter: BleSerialConfig,
    /// Terminal behavior for `connect`
    pub terminal: TerminalConfig,
}

/// Terminal behavior for the `connect` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Appended to every line read from stdin
    pub line_ending: LineEnding,
    /// Hex-encode input and output
    pub hex: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            // ELM327 adapters terminate commands with a carriage return.
            line_ending: LineEnding::Cr,
            hex: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    None,
    Cr,
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            LineEnding::None => b"",
            LineEnding::Cr => b"\r",
            LineEnding::Lf => b"\n",
            LineEnding::CrLf => b"\r\n",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Loading Logic
// ----------------------------------------------------------------------------

impl CliConfig {
    /// Load from `path`, or from the default location when `path` is `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::load_from_file(&path),
                _ => {
                    debug!("No configuration file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config: CliConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ble-serial").join("config.toml"))
    }

    /// Save configuration to a specific file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.transporter
            .validate()
            .map_err(|e| CliError::Config(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
