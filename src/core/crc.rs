//! Message Checksum
//!
//! CRC-16 with the reflected 0x8005 polynomial (0xA001), 0xFFFF init and a
//! final complement. This is the exact checksum the deployed units compute,
//! so frames interoperate across firmware revisions.

const POLY: u16 = 0xA001;

/// Compute the CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
