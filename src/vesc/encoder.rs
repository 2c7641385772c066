//! # VESC Packet Encoder
//!
//! Wraps command payloads into VESC UART frames.

use super::crc::crc16;
use super::protocol::*;
use crate::error::Result;

/// Encode an arbitrary payload into a complete VESC frame
///
/// Payloads up to 255 bytes use the short header (`0x02`, 1-byte length);
/// longer payloads use the long header (`0x03`, 2-byte big-endian length).
///
/// # Errors
///
/// Returns error if the payload is longer than 65535 bytes
///
/// # Examples
///
/// ```
/// use vesc_bridge::vesc::encoder::encode_frame;
///
/// let frame = encode_frame(&[0x04])?;
/// assert_eq!(frame, vec![0x02, 0x01, 0x04, 0x40, 0x84, 0x03]);
/// # Ok::<(), vesc_bridge::error::VescBridgeError>(())
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let frame = VescFrame::new(payload.to_vec())?;
    Ok(frame_bytes(&frame.payload))
}

/// Encode a command into a complete VESC frame
///
/// Command payloads are at most 5 bytes, so this never fails.
pub fn encode_command(command: &VescCommand) -> Vec<u8> {
    frame_bytes(&command.payload())
}

/// Encode a SetDutyCycle command for a duty given in whole percent
///
/// The percent value is clamped to [-100, 100] first.
pub fn encode_duty_percent(percent: i32) -> Vec<u8> {
    encode_command(&VescCommand::SetDutyCycle(duty_percent_to_wire(percent)))
}

/// Clamp a duty percentage to [-100, 100]
pub fn clamp_duty_percent(percent: i32) -> i32 {
    percent.clamp(DUTY_PERCENT_MIN, DUTY_PERCENT_MAX)
}

/// Convert a duty percentage to wire units (percent × 1000), clamping first
pub fn duty_percent_to_wire(percent: i32) -> i32 {
    clamp_duty_percent(percent) * DUTY_WIRE_PER_PERCENT
}

fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 6);

    if payload.len() <= VESC_MAX_SHORT_PAYLOAD {
        frame.push(VESC_START_BYTE_SHORT);
        frame.push(payload.len() as u8);
    } else {
        frame.push(VESC_START_BYTE_LONG);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(payload).to_be_bytes());
    frame.push(VESC_END_BYTE);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get_values_request() {
        let frame = encode_command(&VescCommand::GetValues);
        assert_eq!(frame, vec![0x02, 0x01, 0x04, 0x40, 0x84, 0x03]);
    }

    #[test]
    fn test_encode_short_frame_structure() {
        let payload = [0x05, 0x00, 0x00, 0x27, 0x10];
        let frame = encode_frame(&payload).unwrap();

        assert_eq!(frame.len(), payload.len() + VESC_SHORT_FRAME_OVERHEAD);
        assert_eq!(frame[0], VESC_START_BYTE_SHORT);
        assert_eq!(frame[1], 5);
        assert_eq!(&frame[2..7], &payload);

        let crc = crc16(&payload);
        assert_eq!(frame[7], (crc >> 8) as u8, "CRC high byte first");
        assert_eq!(frame[8], crc as u8);
        assert_eq!(frame[9], VESC_END_BYTE);
    }

    #[test]
    fn test_encode_boundary_255_is_short() {
        let payload = vec![0xAA; 255];
        let frame = encode_frame(&payload).unwrap();
        assert_eq!(frame[0], VESC_START_BYTE_SHORT);
        assert_eq!(frame[1], 255);
        assert_eq!(frame.len(), 255 + 5);
    }

    #[test]
    fn test_encode_long_frame_header() {
        let payload = vec![0x11; 300];
        let frame = encode_frame(&payload).unwrap();

        assert_eq!(frame[0], VESC_START_BYTE_LONG);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 300);
        assert_eq!(frame.len(), 3 + 300 + 2 + 1);
        assert_eq!(*frame.last().unwrap(), VESC_END_BYTE);

        let crc = crc16(&payload);
        assert_eq!(u16::from_be_bytes([frame[303], frame[304]]), crc);
    }

    #[test]
    fn test_encode_oversized_payload_rejected() {
        let payload = vec![0u8; VESC_MAX_PAYLOAD_SIZE + 1];
        assert!(encode_frame(&payload).is_err());
    }

    #[test]
    fn test_duty_clamp() {
        assert_eq!(duty_percent_to_wire(150), 100_000);
        assert_eq!(duty_percent_to_wire(-150), -100_000);
        assert_eq!(duty_percent_to_wire(10), 10_000);
        assert_eq!(duty_percent_to_wire(0), 0);
        assert_eq!(encode_duty_percent(150), encode_duty_percent(100));
        assert_eq!(encode_duty_percent(-150), encode_duty_percent(-100));
    }
}
