//! # Serial Communication Module
//!
//! Handles the UART link to the VESC motor controller.
//!
//! This module handles:
//! - Opening the serial port at 115,200 baud (8N1, no flow control)
//! - Async read/write operations with a channel-level read timeout
//! - Mutual exclusion between the telemetry poller and the duty controller
//! - Input/output buffer resets

pub mod channel;
pub mod port_trait;

pub use channel::{ChannelGuard, SerialChannel};

use std::time::Duration;

use crate::config::SerialConfig;
use crate::error::{Result, VescBridgeError};
use port_trait::TokioSerialPort;
use tracing::{debug, info, warn};

/// Default VESC UART baud rate
pub const VESC_BAUD_RATE: u32 = 115_200;

/// Default device paths to try (in order of preference)
const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/serial0", // Raspberry Pi primary UART alias
    "/dev/ttyAMA0", // PL011 UART
    "/dev/ttyUSB0", // USB-to-serial adapters
];

/// VESC Serial Port Handler
///
/// Owns the opened port until it is turned into a shared [`SerialChannel`].
pub struct VescSerial {
    /// Serial port handle
    port: tokio_serial::SerialStream,
    /// Device path (e.g., /dev/serial0)
    device_path: String,
}

impl std::fmt::Debug for VescSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VescSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl VescSerial {
    /// Open connection to the VESC by trying the default device paths
    ///
    /// # Errors
    ///
    /// Returns error if no device could be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vesc_bridge::serial::VescSerial;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let serial = VescSerial::open()?;
    ///     println!("Connected to: {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open() -> Result<Self> {
        Self::open_with_paths(DEFAULT_DEVICE_PATHS, VESC_BAUD_RATE)
    }

    /// Open the configured port, falling back to `fallback_ports` in order
    pub fn open_from_config(config: &SerialConfig) -> Result<Self> {
        let paths: Vec<&str> = std::iter::once(config.port.as_str())
            .chain(config.fallback_ports.iter().map(String::as_str))
            .collect();

        Self::open_with_paths(&paths, config.baud_rate)
    }

    /// Open connection with custom device paths
    ///
    /// # Arguments
    ///
    /// * `paths` - Device paths to try (e.g., &["/dev/serial0"])
    /// * `baud_rate` - Line speed
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Successfully opened VESC serial port at {} @ {}", path, baud_rate);
                    return Ok(Self {
                        port,
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(VescBridgeError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port with 8N1 settings
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| VescBridgeError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Get the device path of the opened serial port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Convert into the shared channel used by the poller and duty controller
    pub fn into_channel(self, read_timeout: Duration) -> SerialChannel {
        SerialChannel::new(TokioSerialPort::new(self.port), read_timeout)
    }
}
