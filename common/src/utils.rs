//! Common Utilities
//!
//! Bit packing and integrity helpers shared by the PHY paths.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Calculate the IEEE 1901 CRC-24 over a byte slice
pub fn crc24(data: &[u8]) -> u32 {
    const CRC24_POLY: u32 = 0x1864CFB;
    let mut crc: u32 = 0;

    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            if crc & 0x800000 != 0 {
                crc = (crc << 1) ^ CRC24_POLY;
            } else {
                crc <<= 1;
            }
        }
    }

    crc & 0xFFFFFF
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[bool]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte & (1 << (7 - i))) != 0);
        }
    }

    bits
}

/// Append the CRC-24 of a byte-aligned bit vector to itself
pub fn crc24_append(bits: &mut Vec<bool>) {
    let crc = crc24(&pack_bits(bits));
    trace!("appending crc24 {:06x} over {} bits", crc, bits.len());
    for i in (0..24).rev() {
        bits.push((crc >> i) & 1 != 0);
    }
}

/// Verify a bit vector whose last 24 bits are the CRC-24 of the rest
pub fn crc24_check(bits: &[bool]) -> bool {
    if bits.len() < 24 {
        return false;
    }
    let (data, tail) = bits.split_at(bits.len() - 24);
    let mut crc_rx: u32 = 0;
    for &bit in tail {
        crc_rx = (crc_rx << 1) | bit as u32;
    }
    crc24(&pack_bits(data)) == crc_rx
}
