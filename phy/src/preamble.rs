//! Preamble Construction
//!
//! The preamble is ten SYNCP periods; the last two and a half are phase
//! inverted, which gives the receiver its frame-alignment landmark. The
//! SYNCP spectrum carries unit magnitude on every active sync carrier
//! with a phase drawn from the PN-derived carrier angle table, one of
//! sixteen phases per carrier.

use crate::fft::FftEngine;
use crate::scrambler::PnGenerator;
use common::ieee1901::{
    NUMBER_OF_CARRIERS, N_SYNC_CARRIERS, PREAMBLE_SIZE, SYNCP_SIZE, SYNC_CARRIER_SPACING,
};
use common::types::SyncToneMask;
use num_complex::Complex32;
use std::f32::consts::TAU;

/// Seed of the carrier angle table generator
const ANGLE_TABLE_SEED: u16 = 0x2BD;

/// Sample index where the preamble phase inverts: 7.5 SYNCP periods
pub const PHASE_INVERSION_START: usize = 15 * SYNCP_SIZE / 2;

/// Sixteen-phase constellation value for an angle number
pub fn angle_number_to_value(n: u8) -> Complex32 {
    let phi = TAU * (n & 0xF) as f32 / 16.0;
    Complex32::new(phi.cos(), phi.sin())
}

/// Per-payload-carrier angle numbers, PN-derived and identical across
/// runs
pub fn carriers_angle_number() -> Vec<u8> {
    let mut pn = PnGenerator::new(ANGLE_TABLE_SEED);
    (0..NUMBER_OF_CARRIERS)
        .map(|_| (pn.next_word(4) & 0xF) as u8)
        .collect()
}

/// Immutable preamble reference shared by the transmit and receive paths
#[derive(Debug, Clone)]
pub struct Preamble {
    /// The full real-valued preamble
    pub samples: Vec<f32>,
    /// One SYNCP period
    pub syncp: Vec<f32>,
    /// SYNCP reference spectrum, one value per sync carrier
    pub syncp_freq: Vec<Complex32>,
}

impl Preamble {
    pub fn new(sync_mask: &SyncToneMask, fft: &mut FftEngine) -> Self {
        let angles = carriers_angle_number();
        let mut syncp_freq = vec![Complex32::new(0.0, 0.0); N_SYNC_CARRIERS];
        for k in sync_mask.iter_active() {
            // Sync carrier k coincides with payload carrier 8k
            syncp_freq[k] = angle_number_to_value(angles[k * SYNC_CARRIER_SPACING]);
        }

        let syncp = fft.ifft_syncp(&syncp_freq);

        let mut samples = Vec::with_capacity(PREAMBLE_SIZE);
        for i in 0..PREAMBLE_SIZE {
            let s = syncp[i % SYNCP_SIZE];
            samples.push(if i < PHASE_INVERSION_START { s } else { -s });
        }

        Self {
            samples,
            syncp,
            syncp_freq,
        }
    }

    /// Matched-filter reference: the first phase-inverted SYNCP period
    pub fn sync_window(&self) -> &[f32] {
        &self.samples[PHASE_INVERSION_START..PHASE_INVERSION_START + SYNCP_SIZE]
    }
}
