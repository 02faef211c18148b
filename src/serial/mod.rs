//! # Serial Communication Module
//!
//! Discovers and opens the sensor's serial device.
//!
//! This module handles:
//! - Opening an explicit device path at the configured baud rate
//! - Enumerating serial devices for `auto` detection
//! - Platform-specific candidate filtering and vendor preference
//! - Optional probing of candidates for sensor output

pub mod port_trait;

use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::Platform;
use crate::error::{LoggerError, Result};
use crate::sensor::decoder::decode_frame;
use crate::sensor::framer::FrameReader;
use crate::sensor::protocol::CaptureTime;
pub use port_trait::{SerialPortIO, TokioSerialPort};

/// USB vendor ids of common USB-serial bridges
const KNOWN_BRIDGE_VIDS: &[u16] = &[
    0x0403, // FTDI
    0x10C4, // Silicon Labs CP210x
    0x067B, // Prolific PL2303
    0x1A86, // WCH CH34x
];

/// Most frames inspected while probing one candidate
const PROBE_MAX_FRAMES: usize = 12;

/// Which device the session should use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelection {
    /// Enumerate and pick the first matching device
    Auto,
    /// Use exactly this device
    Path(String),
}

impl From<&str> for PortSelection {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("auto") {
            PortSelection::Auto
        } else {
            PortSelection::Path(s.to_string())
        }
    }
}

/// An enumerated serial device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device path (e.g., /dev/ttyUSB0 or COM3)
    pub path: String,
    /// USB vendor id, when the device is a USB port
    pub usb_vid: Option<u16>,
    /// USB product id, when the device is a USB port
    pub usb_pid: Option<u16>,
}

impl DeviceInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            usb_vid: None,
            usb_pid: None,
        }
    }

    pub fn usb(path: impl Into<String>, vid: u16, pid: u16) -> Self {
        Self {
            path: path.into(),
            usb_vid: Some(vid),
            usb_pid: Some(pid),
        }
    }
}

/// Source of candidate devices
#[cfg_attr(test, mockall::automock)]
pub trait DeviceLister: Send + Sync {
    fn list(&self) -> Result<Vec<DeviceInfo>>;
}

/// Enumerates the system's serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDeviceLister;

impl DeviceLister for SystemDeviceLister {
    fn list(&self) -> Result<Vec<DeviceInfo>> {
        let ports = tokio_serial::available_ports()
            .map_err(|e| LoggerError::NoDeviceFound(format!("port enumeration failed: {}", e)))?;

        Ok(ports
            .into_iter()
            .map(|p| match p.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => {
                    DeviceInfo::usb(p.port_name, usb.vid, usb.pid)
                }
                _ => DeviceInfo::new(p.port_name),
            })
            .collect())
    }
}

/// Opens a device path as a readable port
#[cfg_attr(test, mockall::automock)]
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>>;
}

/// Opens real serial devices through tokio-serial
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LoggerError::DeviceOpen {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(TokioSerialPort::new(port)))
    }
}

/// Strategy narrowing and ordering auto-detect candidates
///
/// Receives candidates already sorted by path.
pub trait DeviceFilter: Send + Sync {
    fn select(&self, candidates: Vec<DeviceInfo>) -> Vec<DeviceInfo>;
}

/// Path-pattern filter per platform, with known USB-serial bridges first
#[derive(Debug, Clone, Copy)]
pub struct PlatformFilter {
    platform: Platform,
}

impl PlatformFilter {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    fn prefixes(&self) -> &'static [&'static str] {
        match self.platform {
            Platform::Linux => &["/dev/ttyUSB", "/dev/ttyACM", "/dev/ttyS"],
            Platform::Pi => &["/dev/ttyUSB", "/dev/ttyACM"],
            Platform::Mac => &[
                "/dev/tty.usbserial-",
                "/dev/cu.usbserial-",
                "/dev/tty.usbmodem",
                "/dev/cu.usbmodem",
            ],
            Platform::Windows => &["COM"],
        }
    }
}

impl DeviceFilter for PlatformFilter {
    fn select(&self, candidates: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
        let prefixes = self.prefixes();
        let mut matching: Vec<DeviceInfo> = candidates
            .into_iter()
            .filter(|d| prefixes.iter().any(|p| d.path.starts_with(p)))
            .collect();

        // Built-in UARTs only when nothing else is attached
        let has_usb = matching.iter().any(|d| !d.path.starts_with("/dev/ttyS"));
        if self.platform == Platform::Linux && has_usb {
            matching.retain(|d| !d.path.starts_with("/dev/ttyS"));
        }

        let (mut preferred, rest): (Vec<_>, Vec<_>) = matching
            .into_iter()
            .partition(|d| d.usb_vid.is_some_and(|vid| KNOWN_BRIDGE_VIDS.contains(&vid)));
        preferred.extend(rest);
        preferred
    }
}

/// An opened sensor port
pub struct ResolvedPort {
    /// Device path that was opened
    pub path: String,
    /// The open port
    pub port: Box<dyn SerialPortIO>,
}

impl std::fmt::Debug for ResolvedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPort")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Port Resolver
///
/// Confirms an explicit path opens, or auto-detects the sensor among the
/// enumerated devices.
pub struct PortResolver {
    lister: Box<dyn DeviceLister>,
    opener: Box<dyn PortOpener>,
    filter: Box<dyn DeviceFilter>,
    baud_rate: u32,
    probe_timeout: Option<Duration>,
    max_frame_len: usize,
}

impl PortResolver {
    /// Create a resolver from its collaborators
    pub fn new(
        lister: Box<dyn DeviceLister>,
        opener: Box<dyn PortOpener>,
        filter: Box<dyn DeviceFilter>,
        baud_rate: u32,
    ) -> Self {
        Self {
            lister,
            opener,
            filter,
            baud_rate,
            probe_timeout: None,
            max_frame_len: crate::sensor::framer::DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Resolver over the real system ports, filtered for `platform`
    pub fn system(platform: Platform, baud_rate: u32) -> Self {
        Self::new(
            Box::new(SystemDeviceLister),
            Box::new(SystemPortOpener),
            Box::new(PlatformFilter::new(platform)),
            baud_rate,
        )
    }

    /// Require auto-detected candidates to emit sensor frames within `timeout`
    pub fn with_probe(mut self, timeout: Duration, max_frame_len: usize) -> Self {
        self.probe_timeout = Some(timeout);
        self.max_frame_len = max_frame_len;
        self
    }

    /// Candidates for auto-detection, in the order they will be tried
    ///
    /// Devices are sorted by path before filtering so the outcome is
    /// reproducible.
    pub fn candidates(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = self.lister.list()?;
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices.dedup_by(|a, b| a.path == b.path);
        Ok(self.filter.select(devices))
    }

    /// Resolve and open the sensor port
    ///
    /// # Errors
    ///
    /// - `DeviceOpen` if an explicit path cannot be opened
    /// - `NoDeviceFound` if auto-detection yields no usable candidate
    pub async fn resolve(&self, selection: &PortSelection) -> Result<ResolvedPort> {
        match selection {
            PortSelection::Path(path) => self.open_path(path),
            PortSelection::Auto => self.auto_detect().await,
        }
    }

    /// Open an explicit device path
    pub fn open_path(&self, path: &str) -> Result<ResolvedPort> {
        debug!("Opening serial port: {}", path);
        let port = self.opener.open(path, self.baud_rate)?;
        info!("Connected to {} at {} baud", path, self.baud_rate);
        Ok(ResolvedPort {
            path: path.to_string(),
            port,
        })
    }

    async fn auto_detect(&self) -> Result<ResolvedPort> {
        let candidates = self.candidates()?;
        if candidates.is_empty() {
            return Err(LoggerError::NoDeviceFound("no candidate devices".to_string()));
        }

        info!("Found {} candidate serial port(s)", candidates.len());

        let mut tried = Vec::with_capacity(candidates.len());
        for device in candidates {
            tried.push(device.path.clone());

            let port = match self.opener.open(&device.path, self.baud_rate) {
                Ok(port) => port,
                Err(e) => {
                    warn!("Failed to open {}: {}", device.path, e);
                    continue;
                }
            };

            let port = match self.probe_timeout {
                None => port,
                Some(timeout) => match self.probe(port, timeout).await {
                    Some(port) => port,
                    None => {
                        warn!("No sensor data on {}", device.path);
                        continue;
                    }
                },
            };

            info!("Connected to {} at {} baud", device.path, self.baud_rate);
            return Ok(ResolvedPort {
                path: device.path,
                port,
            });
        }

        Err(LoggerError::NoDeviceFound(tried.join(", ")))
    }

    /// Read a few frames and keep the port only if one decodes
    async fn probe(
        &self,
        port: Box<dyn SerialPortIO>,
        timeout: Duration,
    ) -> Option<Box<dyn SerialPortIO>> {
        let mut reader = FrameReader::new(port, self.max_frame_len, timeout);

        let detected = tokio::time::timeout(timeout, async {
            for _ in 0..PROBE_MAX_FRAMES {
                match reader.next_frame().await {
                    Ok(frame) => {
                        if decode_frame(&frame, CaptureTime::now()).is_ok() {
                            return true;
                        }
                    }
                    Err(LoggerError::FrameOverflow { .. }) => continue,
                    Err(_) => return false,
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if detected {
            reader.reset();
            Some(reader.into_port())
        } else {
            None
        }
    }
}

impl std::fmt::Debug for PortResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortResolver")
            .field("baud_rate", &self.baud_rate)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}
