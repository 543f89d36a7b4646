//! IEEE 1901 FFT-OFDM Numerology
//!
//! Frozen constants of the FFT-OFDM physical layer: sampling, carrier
//! counts, symbol geometry and receiver tuning. Values follow the
//! HomePlug AV heritage profile of the standard.

use crate::types::{SyncToneMask, ToneMask};

/// Baseband sample rate in Hz
pub const SAMPLE_RATE: u32 = 75_000_000;
/// Number of payload carriers (positive-frequency FFT bins)
pub const NUMBER_OF_CARRIERS: usize = 1536;
/// Payload FFT length (real transform)
pub const FFT_SIZE: usize = 2 * NUMBER_OF_CARRIERS;
/// SYNCP symbol length in samples (real transform length)
pub const SYNCP_SIZE: usize = 384;
/// Number of SYNCP carriers
pub const N_SYNC_CARRIERS: usize = SYNCP_SIZE / 2;
/// SYNCP carrier spacing expressed in payload carriers
pub const SYNC_CARRIER_SPACING: usize = FFT_SIZE / SYNCP_SIZE;
/// Preamble length: ten SYNCP periods
pub const PREAMBLE_SIZE: usize = 10 * SYNCP_SIZE;
/// Number of frame control bits per MPDU
pub const FRAME_CONTROL_NBITS: usize = 128;
/// Frame control length in bytes
pub const FRAME_CONTROL_BYTES: usize = FRAME_CONTROL_NBITS / 8;
/// Guard interval of the frame control symbol in samples
pub const GUARD_INTERVAL_FC: usize = 1374;
/// Guard interval of payload symbols in samples
pub const GUARD_INTERVAL_PAYLOAD: usize = 417;
/// Raised-cosine rolloff interval in samples
pub const ROLLOFF_INTERVAL: usize = 372;
/// Frame control symbol length in samples (guard interval + FFT)
pub const FRAME_CONTROL_SIZE: usize = FFT_SIZE + GUARD_INTERVAL_FC;
/// Minimum inter-frame space in samples (100 us RIFS)
pub const MIN_INTERFRAME_SPACE: usize = 7500;

/// Receiver autocorrelation threshold
pub const SYNC_THRESHOLD: f32 = 0.9;
/// Receiver minimum signal energy
pub const SYNC_MIN_ENERGY: f32 = 1e-3;
/// Receiver minimum autocorrelation plateau, 5.5 SYNCP periods
pub const SYNC_MIN_PLATEAU: usize = 11 * SYNCP_SIZE / 2;
/// Receiver frame alignment window, two SYNCP periods
pub const SYNC_LENGTH: usize = 2 * SYNCP_SIZE;

/// First and last payload carrier of the regulatory band
pub const BAND_FIRST_CARRIER: usize = 74;
pub const BAND_LAST_CARRIER: usize = 1228;

/// Notched carrier bands excluded from the broadcast tone mask
/// (inclusive ranges)
const BROADCAST_NOTCHES: &[(usize, usize)] = &[
    (86, 90),
    (140, 149),
    (167, 171),
    (215, 225),
    (283, 302),
    (410, 419),
    (570, 591),
    (737, 748),
    (1061, 1092),
];

/// First and last active SYNCP carrier
pub const SYNC_FIRST_CARRIER: usize = 10;
pub const SYNC_LAST_CARRIER: usize = 153;

/// Regulatory tone mask: every carrier that may ever carry energy
pub fn default_tone_mask() -> ToneMask {
    ToneMask::from_range(BAND_FIRST_CARRIER, BAND_LAST_CARRIER)
}

/// Broadcast tone mask: the regulatory band minus the notched bands
pub fn default_broadcast_tone_mask() -> ToneMask {
    let mut mask = default_tone_mask();
    for &(lo, hi) in BROADCAST_NOTCHES {
        for carrier in lo..=hi {
            mask.set(carrier, false);
        }
    }
    mask
}

/// SYNCP tone mask used on preamble symbols
pub fn default_sync_tone_mask() -> SyncToneMask {
    SyncToneMask::from_range(SYNC_FIRST_CARRIER, SYNC_LAST_CARRIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_geometry() {
        assert_eq!(FFT_SIZE, 3072);
        assert_eq!(PREAMBLE_SIZE, 3840);
        assert_eq!(FRAME_CONTROL_SIZE, 4446);
        assert_eq!(SYNC_MIN_PLATEAU, 2112);
        // The rolloff must stay inside the payload guard interval so the
        // receiver FFT window is never touched by windowing.
        assert!(ROLLOFF_INTERVAL < GUARD_INTERVAL_PAYLOAD);
        assert!(ROLLOFF_INTERVAL < GUARD_INTERVAL_FC);
    }

    #[test]
    fn test_default_masks() {
        let tone = default_tone_mask();
        let broadcast = default_broadcast_tone_mask();
        assert_eq!(tone.count(), 1155);
        assert!(broadcast.count() < tone.count());
        // Broadcast mask is a strict subset of the regulatory mask
        for k in 0..NUMBER_OF_CARRIERS {
            if broadcast.is_active(k) {
                assert!(tone.is_active(k));
            }
        }
        assert!(!broadcast.is_active(87));
        assert!(!broadcast.is_active(1092));
        assert!(broadcast.is_active(1093));
    }

    #[test]
    fn test_default_sync_mask() {
        let sync = default_sync_tone_mask();
        assert_eq!(sync.count(), SYNC_LAST_CARRIER - SYNC_FIRST_CARRIER + 1);
        assert!(!sync.is_active(0));
        assert!(sync.is_active(10));
    }
}
