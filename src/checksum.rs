//! # Checksum Engine
//!
//! Stateless checksum functions for the two serial flavors:
//!
//! - [`lrc8`]: Longitudinal Redundancy Check used by Modbus ASCII
//! - [`crc16`]: table-driven CRC-16/MODBUS used by Modbus RTU
//!
//! Both functions operate on a byte slice. Callers restrict the range by
//! sub-slicing, e.g. `crc16(&frame[..frame.len() - 2])` to verify a received
//! RTU frame. The lookup tables are built at compile time and never mutated.
//!
//! ```rust
//! use modbus_master::checksum::{crc16, lrc8};
//!
//! // Read 10 holding registers from unit 1
//! assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), (0xC5, 0xCD));
//! assert_eq!(lrc8(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0xFA);
//! ```

/// Reflected form of the Modbus CRC polynomial (0x8005)
const CRC16_POLY: u16 = 0xA001;

/// Low-byte half of the CRC lookup table
static CRC_TABLE_LO: [u8; 256] = build_crc_table(false);

/// High-byte half of the CRC lookup table
static CRC_TABLE_HI: [u8; 256] = build_crc_table(true);

const fn build_crc_table(high: bool) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ CRC16_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = if high { (crc >> 8) as u8 } else { crc as u8 };
        i += 1;
    }
    table
}

/// Compute the Modbus LRC of `data`
///
/// The LRC is the two's complement of the 8-bit sum of all bytes, so that
/// adding the LRC to the sum of the payload yields zero.
pub fn lrc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

/// Compute the Modbus CRC-16 of `data`
///
/// # Returns
///
/// `(lo, hi)`: the two CRC bytes in the order they are transmitted on the
/// wire. The register starts at `0xFFFF`.
pub fn crc16(data: &[u8]) -> (u8, u8) {
    let mut lo: u8 = 0xFF;
    let mut hi: u8 = 0xFF;

    for &byte in data {
        let index = (lo ^ byte) as usize;
        lo = hi ^ CRC_TABLE_LO[index];
        hi = CRC_TABLE_HI[index];
    }

    (lo, hi)
}

/// CRC of `data` as a 16-bit value whose little-endian bytes are the wire bytes
pub fn crc16_value(data: &[u8]) -> u16 {
    let (lo, hi) = crc16(data);
    u16::from_le_bytes([lo, hi])
}
