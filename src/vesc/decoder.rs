//! # VESC Packet Decoder
//!
//! Pulls CRC-checked payloads out of an accumulating receive buffer and
//! decodes COMM_GET_VALUES telemetry.
//!
//! Responses routinely arrive split across several serial reads, so frame
//! extraction is always run over the cumulative buffer and any incomplete
//! trailing frame is kept for the next read.

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use super::crc::crc16;
use super::protocol::*;
use crate::error::{Result, VescBridgeError};

/// Default receive buffer cap before it is discarded as noise
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 1000;

/// Result of scanning a buffer for frames
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameScan {
    /// Payloads of every valid frame, in arrival order
    pub payloads: Vec<Vec<u8>>,
    /// Bytes up to and including the last valid frame
    pub consumed: usize,
    /// Complete frames rejected for a CRC mismatch
    pub crc_errors: usize,
}

/// Scan a buffer for short (`0x02`) VESC frames
///
/// Bytes that are not a start byte are skipped one at a time. A frame with a
/// bad terminator or a CRC mismatch is skipped by advancing a single byte so
/// the scan can resynchronize. Scanning stops at the first start byte whose
/// frame is not yet complete; everything from `consumed` onward must be kept
/// and rescanned once more bytes arrive.
///
/// # Examples
///
/// ```
/// use vesc_bridge::vesc::decoder::extract_frames;
///
/// let scan = extract_frames(&[0x02, 0x01, 0x04, 0x40, 0x84, 0x03]);
/// assert_eq!(scan.payloads, vec![vec![0x04]]);
/// assert_eq!(scan.consumed, 6);
/// ```
pub fn extract_frames(buf: &[u8]) -> FrameScan {
    let mut scan = FrameScan::default();
    let mut i = 0;

    while i < buf.len() {
        if buf[i] != VESC_START_BYTE_SHORT {
            i += 1;
            continue;
        }

        // Need start + length before the frame size is known
        if i + 2 > buf.len() {
            break;
        }

        let length = buf[i + 1] as usize;
        let frame_len = length + VESC_SHORT_FRAME_OVERHEAD;

        if i + frame_len > buf.len() {
            break;
        }

        if buf[i + frame_len - 1] != VESC_END_BYTE {
            debug!("Bad frame terminator at offset {}, resynchronizing", i);
            i += 1;
            continue;
        }

        let payload = &buf[i + 2..i + 2 + length];
        let received_crc = u16::from_be_bytes([buf[i + 2 + length], buf[i + 3 + length]]);
        let calculated_crc = crc16(payload);

        if calculated_crc == received_crc {
            scan.payloads.push(payload.to_vec());
            scan.consumed = i + frame_len;
            i = scan.consumed;
        } else {
            warn!(
                "CRC error: received 0x{:04X}, calculated 0x{:04X}",
                received_crc, calculated_crc
            );
            scan.crc_errors += 1;
            i += 1;
        }
    }

    scan
}

/// Receive buffer owned by a single reader
///
/// Accumulates raw serial bytes, drops everything up to the last consumed
/// frame after each scan and discards the whole buffer once it grows past
/// `max_len` (sustained noise or protocol desync).
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_len: usize,
}

/// Outcome of feeding bytes into a [`FrameBuffer`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedResult {
    pub payloads: Vec<Vec<u8>>,
    pub crc_errors: usize,
    /// Bytes discarded because the buffer exceeded its cap
    pub discarded: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

impl FrameBuffer {
    /// Create an empty buffer that is cleared when it exceeds `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_len.min(4096)),
            max_len,
        }
    }

    /// Append newly read bytes and extract every complete frame
    pub fn feed(&mut self, data: &[u8]) -> FeedResult {
        self.buf.extend_from_slice(data);

        let scan = extract_frames(&self.buf);
        self.buf.advance(scan.consumed);

        let mut discarded = 0;
        if self.buf.len() > self.max_len {
            warn!("Receive buffer overflow ({} bytes), clearing", self.buf.len());
            discarded = self.buf.len();
            self.buf.clear();
        }

        FeedResult {
            payloads: scan.payloads,
            crc_errors: scan.crc_errors,
            discarded,
        }
    }

    /// Bytes currently retained (partial frames and unsynchronized noise)
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Big-endian field reader that fails instead of panicking on short input
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take<const N: usize>(&mut self, field: &str) -> std::result::Result<[u8; N], String> {
        let end = self.offset + N;
        let bytes = self.data.get(self.offset..end).ok_or_else(|| {
            format!(
                "payload ended inside '{}' (offset {}, length {})",
                field,
                self.offset,
                self.data.len()
            )
        })?;

        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.offset = end;
        Ok(out)
    }

    fn i16(&mut self, field: &str) -> std::result::Result<i16, String> {
        Ok(i16::from_be_bytes(self.take::<2>(field)?))
    }

    fn i32(&mut self, field: &str) -> std::result::Result<i32, String> {
        Ok(i32::from_be_bytes(self.take::<4>(field)?))
    }
}

/// Decode a COMM_GET_VALUES response payload
///
/// A leading command id (4) is stripped when present; firmware versions differ
/// on whether it is echoed.
///
/// # Errors
///
/// Returns `VescBridgeError::Telemetry` if fewer than 46 bytes remain after the
/// optional command id, or if the payload ends inside a field. The error
/// message carries the raw payload in hex.
pub fn decode_get_values(payload: &[u8]) -> Result<TelemetrySample> {
    let body = match payload.first() {
        Some(&COMM_GET_VALUES) => &payload[1..],
        _ => payload,
    };

    if body.len() < GET_VALUES_MIN_PAYLOAD_SIZE {
        return Err(VescBridgeError::Telemetry(format!(
            "GET_VALUES payload too short: {} bytes (raw: {})",
            body.len(),
            hex(payload)
        )));
    }

    decode_values_body(body).map_err(|e| {
        VescBridgeError::Telemetry(format!("{} (raw: {})", e, hex(payload)))
    })
}

fn decode_values_body(body: &[u8]) -> std::result::Result<TelemetrySample, String> {
    let mut r = FieldReader::new(body);

    Ok(TelemetrySample {
        temp_fet: r.i16("temp_fet")? as f64 / 10.0,
        temp_motor: r.i16("temp_motor")? as f64 / 10.0,
        current_motor: r.i32("current_motor")? as f64 / 100.0,
        current_in: r.i32("current_in")? as f64 / 100.0,
        id: r.i32("id")? as f64 / 100.0,
        iq: r.i32("iq")? as f64 / 100.0,
        duty: r.i16("duty")? as f64 / 1000.0,
        rpm: r.i32("rpm")?,
        v_in: r.i16("v_in")? as f64 / 10.0,
        amp_hours: r.i32("amp_hours")? as f64 / 10000.0,
        amp_hours_charged: r.i32("amp_hours_charged")? as f64 / 10000.0,
        watt_hours: r.i32("watt_hours")? as f64 / 10000.0,
        watt_hours_charged: r.i32("watt_hours_charged")? as f64 / 10000.0,
        tachometer: r.i32("tachometer")?,
        tachometer_abs: r.i32("tachometer_abs")?,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// GET_VALUES payload (with echoed command id) packed from known raw values
#[cfg(test)]
pub(crate) fn test_get_values_payload() -> Vec<u8> {
    let mut p = vec![COMM_GET_VALUES];
    p.extend_from_slice(&250i16.to_be_bytes()); // temp_fet 25.0
    p.extend_from_slice(&(-123i16).to_be_bytes()); // temp_motor -12.3
    p.extend_from_slice(&1234i32.to_be_bytes()); // current_motor 12.34
    p.extend_from_slice(&(-567i32).to_be_bytes()); // current_in -5.67
    p.extend_from_slice(&89i32.to_be_bytes()); // id 0.89
    p.extend_from_slice(&(-10i32).to_be_bytes()); // iq -0.10
    p.extend_from_slice(&100i16.to_be_bytes()); // duty 0.100
    p.extend_from_slice(&12345i32.to_be_bytes()); // rpm
    p.extend_from_slice(&243i16.to_be_bytes()); // v_in 24.3
    p.extend_from_slice(&15000i32.to_be_bytes()); // amp_hours 1.5
    p.extend_from_slice(&25i32.to_be_bytes()); // amp_hours_charged 0.0025
    p.extend_from_slice(&360000i32.to_be_bytes()); // watt_hours 36.0
    p.extend_from_slice(&1i32.to_be_bytes()); // watt_hours_charged 0.0001
    p.extend_from_slice(&(-4200i32).to_be_bytes()); // tachometer
    p.extend_from_slice(&4200i32.to_be_bytes()); // tachometer_abs
    p
}
