//! # VESC UART Protocol Module
//!
//! Implementation of the VESC UART packet protocol for the commands this
//! bridge needs.
//!
//! This module handles:
//! - CRC16 (CCITT, XMODEM parameters) checksum calculation
//! - Frame encoding (short and long headers)
//! - Frame extraction from fragmented, noisy receive streams
//! - SetDutyCycle / SetCurrent / GetValues commands
//! - COMM_GET_VALUES telemetry decoding

pub mod protocol;
pub mod encoder;
pub mod decoder;
pub mod crc;
