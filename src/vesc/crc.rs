//! # CRC16 Implementation
//!
//! CRC-16 checksum used by the VESC UART framing (CCITT polynomial,
//! XMODEM parameters).
//!
//! **Polynomial**: 0x1021 (x^16 + x^12 + x^5 + 1)
//! **Initial Value**: 0x0000
//!
//! Only the payload is covered; start byte, length header and end byte are not.

/// CRC-16 CCITT polynomial
const CRC16_POLY: u16 = 0x1021;

/// Precomputed CRC16 lookup table, built once at compile time
const CRC16_TABLE: [u16; 256] = generate_crc16_table();

/// Generate CRC16 lookup table at compile time
const fn generate_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;

    while i < 256 {
        let mut crc: u16 = 0;
        let mut c: u16 = (i as u16) << 8;
        let mut j = 0;

        while j < 8 {
            if ((crc ^ c) & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
            c <<= 1;
            j += 1;
        }

        table[i] = crc;
        i += 1;
    }

    table
}

/// Calculate the VESC CRC16 checksum using the lookup table
///
/// # Arguments
///
/// * `data` - Payload bytes (command id + arguments)
///
/// # Returns
///
/// * `u16` - Checksum, transmitted big-endian after the payload
///
/// # Examples
///
/// ```
/// use vesc_bridge::vesc::crc::crc16;
///
/// // COMM_GET_VALUES request payload
/// assert_eq!(crc16(&[0x04]), 0x4084);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in data {
        crc = (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize];
    }

    crc
}

/// Bitwise CRC16 (slow), used to cross-check the lookup table
#[cfg(test)]
fn crc16_slow(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;

    for &byte in data {
        crc ^= (byte as u16) << 8;

        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
