//! Frame Control Wire Format
//!
//! The 128-bit frame control block identifies the frame delimiter and
//! carries the per-type fields, sealed by a CRC-24 over the first
//! thirteen bytes. SOF and Sound delimiters describe the payload layout;
//! SACK delimiters carry the acknowledgement data inline and have no
//! payload symbols.
//!
//! Layout (bytes, MSB-first packing):
//!   0       delimiter type
//!   1       tone mode          (SOF, Sound)
//!   2       PB size code       (SOF, Sound)
//!   3..5    PB count, LE       (SOF, Sound)
//!   5..7    symbol count, LE   (SOF, Sound)
//!   1..9    sackd              (SACK)
//!   13..16  CRC-24

use crate::PhyError;
use common::ieee1901::FRAME_CONTROL_BYTES;
use common::types::{DelimiterType, PbSize, ToneMode};
use common::utils::crc24;
use num_traits::FromPrimitive;

/// SACK data bytes carried inline in frame control
pub const SACKD_BYTES: usize = 8;

const CRC_OFFSET: usize = FRAME_CONTROL_BYTES - 3;

/// Parsed frame control fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameControlFields {
    pub delimiter: DelimiterType,
    pub tone_mode: ToneMode,
    pub pb_size: PbSize,
    pub n_blocks: usize,
    pub n_symbols: usize,
    pub sackd: [u8; SACKD_BYTES],
}

/// Recompute and store the CRC-24
pub fn seal(fc: &mut [u8; FRAME_CONTROL_BYTES]) {
    let crc = crc24(&fc[..CRC_OFFSET]);
    fc[CRC_OFFSET] = (crc >> 16) as u8;
    fc[CRC_OFFSET + 1] = (crc >> 8) as u8;
    fc[CRC_OFFSET + 2] = crc as u8;
}

fn crc_ok(fc: &[u8; FRAME_CONTROL_BYTES]) -> bool {
    let stored = ((fc[CRC_OFFSET] as u32) << 16)
        | ((fc[CRC_OFFSET + 1] as u32) << 8)
        | fc[CRC_OFFSET + 2] as u32;
    crc24(&fc[..CRC_OFFSET]) == stored
}

/// Parse and validate received frame control bytes
///
/// The payload-layout fields are only decoded for delimiters that carry
/// payload symbols; for SACK they overlap the sackd area.
pub fn parse(fc: &[u8; FRAME_CONTROL_BYTES]) -> Result<FrameControlFields, PhyError> {
    if !crc_ok(fc) {
        return Err(PhyError::InvalidFrameControl("CRC mismatch".into()));
    }
    let delimiter = DelimiterType::from_u8(fc[0])
        .ok_or_else(|| PhyError::InvalidFrameControl(format!("delimiter {}", fc[0])))?;

    let mut fields = FrameControlFields {
        delimiter,
        tone_mode: ToneMode::Standard,
        pb_size: PbSize::Pb520,
        n_blocks: 0,
        n_symbols: 0,
        sackd: [0u8; SACKD_BYTES],
    };

    match delimiter {
        DelimiterType::Sof | DelimiterType::Sound => {
            fields.tone_mode = ToneMode::from_u8(fc[1])
                .ok_or_else(|| PhyError::InvalidFrameControl(format!("tone mode {}", fc[1])))?;
            fields.pb_size = PbSize::from_u8(fc[2])
                .ok_or_else(|| PhyError::InvalidFrameControl(format!("PB size code {}", fc[2])))?;
            fields.n_blocks = u16::from_le_bytes([fc[3], fc[4]]) as usize;
            fields.n_symbols = u16::from_le_bytes([fc[5], fc[6]]) as usize;
        }
        DelimiterType::Sack => {
            fields.sackd.copy_from_slice(&fc[1..1 + SACKD_BYTES]);
        }
        _ => {}
    }
    Ok(fields)
}

/// Rewrite the payload length fields before encoding and reseal
pub fn update(fc: &mut [u8; FRAME_CONTROL_BYTES], n_blocks: usize, n_symbols: usize) {
    let blocks = (n_blocks as u16).to_le_bytes();
    let symbols = (n_symbols as u16).to_le_bytes();
    fc[3] = blocks[0];
    fc[4] = blocks[1];
    fc[5] = symbols[0];
    fc[6] = symbols[1];
    seal(fc);
}

/// Build a start-of-frame frame control
pub fn sof_frame_control(tone_mode: ToneMode, pb_size: PbSize, n_blocks: usize) -> [u8; FRAME_CONTROL_BYTES] {
    let mut fc = [0u8; FRAME_CONTROL_BYTES];
    fc[0] = DelimiterType::Sof as u8;
    fc[1] = tone_mode as u8;
    fc[2] = pb_size as u8;
    update(&mut fc, n_blocks, 0);
    fc
}

/// Build a sound frame control; Mini-ROBO sounds use the 136-byte block
pub fn sound_frame_control(tone_mode: ToneMode) -> [u8; FRAME_CONTROL_BYTES] {
    let pb_size = if tone_mode == ToneMode::MiniRobo {
        PbSize::Pb136
    } else {
        PbSize::Pb520
    };
    let mut fc = [0u8; FRAME_CONTROL_BYTES];
    fc[0] = DelimiterType::Sound as u8;
    fc[1] = tone_mode as u8;
    fc[2] = pb_size as u8;
    update(&mut fc, 1, 0);
    fc
}

/// Build a selective acknowledgement frame control
pub fn sack_frame_control(sackd: &[u8; SACKD_BYTES]) -> [u8; FRAME_CONTROL_BYTES] {
    let mut fc = [0u8; FRAME_CONTROL_BYTES];
    fc[0] = DelimiterType::Sack as u8;
    fc[1..1 + SACKD_BYTES].copy_from_slice(sackd);
    // SACK tone mode and PB size fields overlap the sackd area; parsing
    // ignores them for this delimiter
    seal(&mut fc);
    fc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sof_round_trip() {
        let mut fc = sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 3);
        update(&mut fc, 3, 41);
        let fields = parse(&fc).unwrap();
        assert_eq!(fields.delimiter, DelimiterType::Sof);
        assert_eq!(fields.tone_mode, ToneMode::StdRobo);
        assert_eq!(fields.pb_size, PbSize::Pb520);
        assert_eq!(fields.n_blocks, 3);
        assert_eq!(fields.n_symbols, 41);
    }

    #[test]
    fn test_crc_rejects_corruption() {
        let fc = sof_frame_control(ToneMode::Standard, PbSize::Pb136, 1);
        for byte in 0..FRAME_CONTROL_BYTES {
            let mut bad = fc;
            bad[byte] ^= 0x10;
            assert!(parse(&bad).is_err(), "corruption at byte {}", byte);
        }
    }

    #[test]
    fn test_sack_carries_sackd() {
        let sackd = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let fc = sack_frame_control(&sackd);
        let fields = parse(&fc).unwrap();
        assert_eq!(fields.delimiter, DelimiterType::Sack);
        assert_eq!(fields.sackd, sackd);
    }

    #[test]
    fn test_sound_defaults() {
        let fc = sound_frame_control(ToneMode::MiniRobo);
        let fields = parse(&fc).unwrap();
        assert_eq!(fields.delimiter, DelimiterType::Sound);
        assert_eq!(fields.pb_size, PbSize::Pb136);
        let fc = sound_frame_control(ToneMode::HsRobo);
        assert_eq!(parse(&fc).unwrap().pb_size, PbSize::Pb520);
    }
}
