//! # VESC Protocol Constants and Types
//!
//! Core protocol definitions for the VESC UART packet format.
//!
//! ```text
//! short: 0x02 | len (1)        | payload | crc16 (2, BE) | 0x03
//! long:  0x03 | len (2, BE)    | payload | crc16 (2, BE) | 0x03
//! ```

use serde::Serialize;

use crate::error::{Result, VescBridgeError};

/// Start byte for payloads up to 255 bytes (1-byte length)
pub const VESC_START_BYTE_SHORT: u8 = 0x02;

/// Start byte for payloads longer than 255 bytes (2-byte length)
pub const VESC_START_BYTE_LONG: u8 = 0x03;

/// Frame terminator
pub const VESC_END_BYTE: u8 = 0x03;

/// Largest payload expressible with the 1-byte length header
pub const VESC_MAX_SHORT_PAYLOAD: usize = 255;

/// Largest payload expressible with the 2-byte length header
pub const VESC_MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Bytes around the payload in a short frame: start + len + crc(2) + end
pub const VESC_SHORT_FRAME_OVERHEAD: usize = 5;

/// COMM_GET_VALUES command id
pub const COMM_GET_VALUES: u8 = 4;

/// COMM_SET_DUTY command id
pub const COMM_SET_DUTY: u8 = 5;

/// COMM_SET_CURRENT command id
pub const COMM_SET_CURRENT: u8 = 6;

/// Minimum GET_VALUES payload length (after stripping an echoed command id)
pub const GET_VALUES_MIN_PAYLOAD_SIZE: usize = 46;

/// Duty cycle range in whole percent
pub const DUTY_PERCENT_MIN: i32 = -100;
pub const DUTY_PERCENT_MAX: i32 = 100;

/// Wire units per duty percent (the controller reads duty as ratio × 100000)
pub const DUTY_WIRE_PER_PERCENT: i32 = 1000;

/// Commands this crate sends to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VescCommand {
    /// Duty cycle in wire units (percent × 1000)
    SetDutyCycle(i32),
    /// Motor current in milliamps
    SetCurrent(i32),
    /// Telemetry request
    GetValues,
}

impl VescCommand {
    /// Command id byte
    pub fn id(&self) -> u8 {
        match self {
            VescCommand::SetDutyCycle(_) => COMM_SET_DUTY,
            VescCommand::SetCurrent(_) => COMM_SET_CURRENT,
            VescCommand::GetValues => COMM_GET_VALUES,
        }
    }

    /// Serialize to a frame payload: command id followed by big-endian arguments
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(5);
        payload.push(self.id());

        match self {
            VescCommand::SetDutyCycle(value) | VescCommand::SetCurrent(value) => {
                payload.extend_from_slice(&value.to_be_bytes());
            }
            VescCommand::GetValues => {}
        }

        payload
    }
}

/// VESC frame structure
#[derive(Debug, Clone)]
pub struct VescFrame {
    /// Payload data (command id + arguments)
    pub payload: Vec<u8>,
}

impl VescFrame {
    /// Create a new VESC frame
    ///
    /// # Errors
    ///
    /// Returns error if payload exceeds `VESC_MAX_PAYLOAD_SIZE` (65535 bytes),
    /// which the 2-byte length header cannot express
    pub fn new(payload: Vec<u8>) -> Result<Self> {
        if payload.len() > VESC_MAX_PAYLOAD_SIZE {
            return Err(VescBridgeError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                VESC_MAX_PAYLOAD_SIZE
            )));
        }

        Ok(Self { payload })
    }

    /// Whether the frame uses the 1-byte length header
    pub fn is_short(&self) -> bool {
        self.payload.len() <= VESC_MAX_SHORT_PAYLOAD
    }

    /// Total bytes on the wire
    pub fn wire_len(&self) -> usize {
        let header = if self.is_short() { 2 } else { 3 };
        header + self.payload.len() + 3
    }
}

/// Decoded COMM_GET_VALUES response
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetrySample {
    /// MOSFET temperature in °C
    pub temp_fet: f64,
    /// Motor temperature in °C
    pub temp_motor: f64,
    /// Motor phase current in A
    pub current_motor: f64,
    /// Battery input current in A
    pub current_in: f64,
    /// D-axis current in A
    pub id: f64,
    /// Q-axis current in A
    pub iq: f64,
    /// Duty cycle as a ratio in [-1, 1]
    pub duty: f64,
    /// Electrical RPM
    pub rpm: i32,
    /// Input voltage in V
    pub v_in: f64,
    pub amp_hours: f64,
    pub amp_hours_charged: f64,
    pub watt_hours: f64,
    pub watt_hours_charged: f64,
    pub tachometer: i32,
    pub tachometer_abs: i32,
}

/// Names accepted in a log sink field list, in wire order
pub const TELEMETRY_FIELDS: [&str; 15] = [
    "temp_fet",
    "temp_motor",
    "current_motor",
    "current_in",
    "id",
    "iq",
    "duty",
    "rpm",
    "v_in",
    "amp_hours",
    "amp_hours_charged",
    "watt_hours",
    "watt_hours_charged",
    "tachometer",
    "tachometer_abs",
];

impl TelemetrySample {
    /// Format one field at its display precision
    ///
    /// Returns `None` for unknown field names.
    pub fn format_field(&self, name: &str) -> Option<String> {
        let value = match name {
            "temp_fet" => format!("{:.1}", self.temp_fet),
            "temp_motor" => format!("{:.1}", self.temp_motor),
            "current_motor" => format!("{:.2}", self.current_motor),
            "current_in" => format!("{:.2}", self.current_in),
            "id" => format!("{:.2}", self.id),
            "iq" => format!("{:.2}", self.iq),
            "duty" => format!("{:.3}", self.duty),
            "rpm" => self.rpm.to_string(),
            "v_in" => format!("{:.1}", self.v_in),
            "amp_hours" => format!("{:.4}", self.amp_hours),
            "amp_hours_charged" => format!("{:.4}", self.amp_hours_charged),
            "watt_hours" => format!("{:.4}", self.watt_hours),
            "watt_hours_charged" => format!("{:.4}", self.watt_hours_charged),
            "tachometer" => self.tachometer.to_string(),
            "tachometer_abs" => self.tachometer_abs.to_string(),
            _ => return None,
        };

        Some(value)
    }
}
