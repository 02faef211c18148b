//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration. Platform-dependent defaults (rotation size, window
//! size, probing) are resolved through [`Platform`].

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LoggerError, Result};
use crate::sensor::protocol::{ParamCode, ParameterTable, DEFAULT_BAUD_RATE};
use crate::sensor::validator::StrictnessMode;
use crate::serial::PortSelection;
use crate::telemetry::format::LogFormat;

const MIB: u64 = 1024 * 1024;

/// Baud rates accepted for the sensor link
const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115_200, 230_400, 460_800, 921_600,
];

/// Deployment platform
///
/// Selects the auto-detect filter and the size defaults suited to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Mac,
    Windows,
    /// Raspberry Pi and similar constrained field deployments
    Pi,
}

impl Platform {
    /// Platform of the build target
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else if cfg!(all(
            target_os = "linux",
            any(target_arch = "arm", target_arch = "aarch64")
        )) {
            Platform::Pi
        } else {
            Platform::Linux
        }
    }

    /// Data log size that triggers rotation
    pub fn default_max_file_size(self) -> u64 {
        match self {
            Platform::Linux | Platform::Mac => 50 * MIB,
            Platform::Windows => 100 * MIB,
            Platform::Pi => 10 * MIB,
        }
    }

    /// Rolling statistics window length
    pub fn default_window_size(self) -> usize {
        match self {
            Platform::Linux => 150,
            Platform::Mac | Platform::Pi => 100,
            Platform::Windows => 200,
        }
    }

    /// Whether auto-detect reads candidates for sensor output
    pub fn probes_by_default(self) -> bool {
        self != Platform::Pi
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Linux => "linux",
            Platform::Mac => "mac",
            Platform::Windows => "windows",
            Platform::Pi => "pi",
        })
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "mac" | "macos" => Ok(Platform::Mac),
            "windows" => Ok(Platform::Windows),
            "pi" | "raspberrypi" => Ok(Platform::Pi),
            other => Err(format!(
                "unknown platform '{}' (expected linux, mac, windows or pi)",
                other
            )),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    /// Plausibility overrides keyed by parameter code
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterOverride>,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path or `auto`
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Longest silence before the device is considered gone
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// First reconnect delay; doubles up to `reconnect_max_ms`
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    /// Probe auto-detect candidates for sensor output (platform default if unset)
    #[serde(default)]
    pub probe: Option<bool>,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "Platform::current")]
    pub platform: Platform,
}

/// Data and statistics log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// File name prefix (`<prefix>Data_...`, `<prefix>Stats_...`)
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_formats")]
    pub formats: Vec<LogFormat>,

    /// Rotation size (platform default if unset)
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,

    /// Rotation age in seconds, 0 disables time-based rotation
    #[serde(default = "default_rotate_interval_s")]
    pub rotate_interval_s: u64,

    /// Write invalid readings to data logs with an invalid marker
    #[serde(default = "default_true")]
    pub log_invalid: bool,

    /// Echo every received frame to the diagnostic log
    #[serde(default)]
    pub echo_raw: bool,

    #[serde(default = "default_true")]
    pub save_statistics: bool,

    /// Write a statistics dump every N recorded readings
    #[serde(default = "default_stats_interval_readings")]
    pub stats_interval_readings: u64,

    /// Consecutive failed writes before logging is declared broken
    #[serde(default = "default_max_write_failures")]
    pub max_write_failures: u32,
}

/// Statistics configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    /// Rolling window length (platform default if unset)
    #[serde(default)]
    pub window_size: Option<usize>,

    #[serde(default)]
    pub strictness: StrictnessMode,

    /// Malformed frames in a row that force a reconnect
    #[serde(default = "default_max_consecutive_malformed")]
    pub max_consecutive_malformed: u32,
}

/// Override of one parameter's plausibility entry
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ParameterOverride {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub precision: Option<usize>,
}

// Default value functions
fn default_serial_port() -> String { "auto".to_string() }
fn default_baud_rate() -> u32 { DEFAULT_BAUD_RATE }
fn default_timeout_ms() -> u64 { 5000 }
fn default_reconnect_interval_ms() -> u64 { 1000 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_max_frame_len() -> usize { crate::sensor::framer::DEFAULT_MAX_FRAME_LEN }
fn default_probe_timeout_ms() -> u64 { 2000 }

fn default_log_dir() -> PathBuf { PathBuf::from("./OUTPUT") }
fn default_prefix() -> String { "Trisonica".to_string() }
fn default_formats() -> Vec<LogFormat> { vec![LogFormat::Csv] }
fn default_rotate_interval_s() -> u64 { 86_400 }
fn default_true() -> bool { true }
fn default_stats_interval_readings() -> u64 { 200 }
fn default_max_write_failures() -> u32 { 5 }

fn default_max_consecutive_malformed() -> u32 { 20 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_frame_len: default_max_frame_len(),
            probe: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            platform: Platform::current(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            prefix: default_prefix(),
            formats: default_formats(),
            max_file_size_bytes: None,
            rotate_interval_s: default_rotate_interval_s(),
            log_invalid: true,
            echo_raw: false,
            save_statistics: true,
            stats_interval_readings: default_stats_interval_readings(),
            max_write_failures: default_max_write_failures(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            window_size: None,
            strictness: StrictnessMode::default(),
            max_consecutive_malformed: default_max_consecutive_malformed(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> LoggerError {
    LoggerError::InvalidConfig(msg.into())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trisonica_logger::config::Config;
    ///
    /// let config = Config::load("config/trisonica.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file without validating it
    ///
    /// Used when command-line overrides are applied before validation.
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse_str(&contents)
    }

    /// Parse TOML text without validating it
    pub fn parse_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if any value is out of its valid range
    pub fn validate(&self) -> Result<()> {
        // Serial
        if self.serial.port.trim().is_empty() {
            return Err(invalid("serial port cannot be empty (use \"auto\" to auto-detect)"));
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid(format!(
                "baud_rate {} is not supported (expected one of {:?})",
                self.serial.baud_rate, SUPPORTED_BAUD_RATES
            )));
        }

        if self.serial.timeout_ms < 100 || self.serial.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms must be between 100 and 300000"));
        }

        if self.serial.reconnect_interval_ms == 0 || self.serial.reconnect_interval_ms > 60_000 {
            return Err(invalid("reconnect_interval_ms must be between 1 and 60000"));
        }

        if self.serial.reconnect_max_ms < self.serial.reconnect_interval_ms
            || self.serial.reconnect_max_ms > 3_600_000
        {
            return Err(invalid(
                "reconnect_max_ms must be between reconnect_interval_ms and 3600000",
            ));
        }

        if self.serial.max_frame_len < 16 || self.serial.max_frame_len > 65_536 {
            return Err(invalid("max_frame_len must be between 16 and 65536"));
        }

        if self.serial.probe_timeout_ms == 0 || self.serial.probe_timeout_ms > 60_000 {
            return Err(invalid("probe_timeout_ms must be between 1 and 60000"));
        }

        // Logging
        if self.logging.log_dir.as_os_str().is_empty() {
            return Err(invalid("log_dir cannot be empty"));
        }

        if self.logging.prefix.is_empty()
            || self.logging.prefix.contains(['/', '\\'])
        {
            return Err(invalid("prefix must be a non-empty file name fragment"));
        }

        if self.logging.formats.is_empty() {
            return Err(invalid("at least one log format must be selected"));
        }

        for (i, format) in self.logging.formats.iter().enumerate() {
            if self.logging.formats[..i].contains(format) {
                return Err(invalid(format!("log format '{}' selected twice", format)));
            }
        }

        if let Some(size) = self.logging.max_file_size_bytes {
            if size < 1024 {
                return Err(invalid("max_file_size_bytes must be at least 1024"));
            }
        }

        if self.logging.stats_interval_readings == 0 {
            return Err(invalid("stats_interval_readings must be greater than 0"));
        }

        if self.logging.max_write_failures == 0 {
            return Err(invalid("max_write_failures must be greater than 0"));
        }

        // Statistics
        if let Some(window) = self.stats.window_size {
            if window == 0 || window > 1_000_000 {
                return Err(invalid("window_size must be between 1 and 1000000"));
            }
        }

        if self.stats.max_consecutive_malformed == 0 {
            return Err(invalid("max_consecutive_malformed must be greater than 0"));
        }

        // Parameter overrides
        self.parameter_table()?;

        Ok(())
    }

    /// Port selection from `serial.port`
    pub fn port_selection(&self) -> PortSelection {
        PortSelection::from(self.serial.port.as_str())
    }

    /// Effective rotation size
    pub fn max_file_size(&self) -> u64 {
        self.logging
            .max_file_size_bytes
            .unwrap_or_else(|| self.serial.platform.default_max_file_size())
    }

    /// Effective rotation age, `None` when disabled
    pub fn rotate_interval(&self) -> Option<Duration> {
        match self.logging.rotate_interval_s {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Effective rolling window length
    pub fn window_size(&self) -> usize {
        self.stats
            .window_size
            .unwrap_or_else(|| self.serial.platform.default_window_size())
    }

    /// Effective probing timeout, `None` when probing is off
    pub fn probe_timeout(&self) -> Option<Duration> {
        let enabled = self
            .serial
            .probe
            .unwrap_or_else(|| self.serial.platform.probes_by_default());
        enabled.then(|| Duration::from_millis(self.serial.probe_timeout_ms))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.timeout_ms)
    }

    /// Built-in plausibility table with the configured overrides applied
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unknown codes or inverted ranges
    pub fn parameter_table(&self) -> Result<ParameterTable> {
        let mut table = ParameterTable::builtin();
        for (code, over) in &self.parameters {
            let code: ParamCode = code.parse()?;
            if let Some(precision) = over.precision {
                if precision > 9 {
                    return Err(invalid(format!("parameter {} precision must be at most 9", code)));
                }
            }
            table = table.with_override(code, over.min, over.max, over.precision)?;
        }
        Ok(table)
    }
}
