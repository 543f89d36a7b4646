//! Common Types for the IEEE 1901 PHY
//!
//! Defines the fundamental modulation, coding and tone-set types used
//! throughout the powerline modem.

use crate::ieee1901::{NUMBER_OF_CARRIERS, N_SYNC_CARRIERS, SYNC_CARRIER_SPACING};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Per-carrier modulation assignment
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    FromPrimitive,
    ToPrimitive,
    Serialize,
    Deserialize,
)]
pub enum Modulation {
    /// Carrier carries no data
    Nulled = 0,
    Bpsk = 1,
    Qpsk = 2,
    Qam8 = 3,
    Qam16 = 4,
    Qam64 = 5,
    Qam256 = 6,
    Qam1024 = 7,
    Qam4096 = 8,
}

impl Modulation {
    /// Bits carried per symbol on one carrier
    pub fn bits(&self) -> usize {
        match self {
            Modulation::Nulled => 0,
            Modulation::Bpsk => 1,
            Modulation::Qpsk => 2,
            Modulation::Qam8 => 3,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
            Modulation::Qam256 => 8,
            Modulation::Qam1024 => 10,
            Modulation::Qam4096 => 12,
        }
    }
}

/// Turbo code rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum CodeRate {
    Rate1_2 = 0,
    Rate16_21 = 1,
    Rate16_18 = 2,
}

impl CodeRate {
    /// Column index into the channel interleaver tables
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Physical block size in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum PbSize {
    Pb16 = 0,
    Pb136 = 1,
    Pb520 = 2,
}

impl PbSize {
    /// Block size in bytes
    pub fn bytes(&self) -> usize {
        match self {
            PbSize::Pb16 => 16,
            PbSize::Pb136 => 136,
            PbSize::Pb520 => 520,
        }
    }

    /// Row index into the channel interleaver tables
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Modulation plan for a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum ToneMode {
    /// Custom tone map negotiated via channel estimation
    Standard = 0,
    /// Five-copy robust mode for short management frames
    MiniRobo = 1,
    /// Four-copy robust mode
    StdRobo = 2,
    /// Two-copy robust mode
    HsRobo = 3,
}

impl ToneMode {
    /// Redundant copy factor of the ROBO copier, 1 for standard mode
    pub fn n_copies(&self) -> usize {
        match self {
            ToneMode::Standard => 1,
            ToneMode::MiniRobo => 5,
            ToneMode::StdRobo => 4,
            ToneMode::HsRobo => 2,
        }
    }

    pub fn is_robo(&self) -> bool {
        !matches!(self, ToneMode::Standard)
    }
}

/// Frame delimiter type carried in frame control
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum DelimiterType {
    Beacon = 0,
    Sof = 1,
    Sack = 2,
    RtsCts = 3,
    Sound = 4,
    Rsof = 5,
}

/// Channel estimation mode selected at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEstMode {
    /// Estimate from the received preamble only
    Preamble,
    /// Estimate from sound MPDUs with known payload
    Sound,
    /// Re-estimate per frame from payload carriers known to be QPSK
    PayloadQpsk,
}

/// Fixed-length set of active payload carriers
#[derive(Clone, PartialEq, Eq)]
pub struct ToneMask {
    active: [bool; NUMBER_OF_CARRIERS],
}

impl ToneMask {
    /// All carriers masked off
    pub fn empty() -> Self {
        Self {
            active: [false; NUMBER_OF_CARRIERS],
        }
    }

    /// Mask with the inclusive carrier range `lo..=hi` active
    pub fn from_range(lo: usize, hi: usize) -> Self {
        let mut mask = Self::empty();
        for carrier in lo..=hi.min(NUMBER_OF_CARRIERS - 1) {
            mask.active[carrier] = true;
        }
        mask
    }

    pub fn is_active(&self, carrier: usize) -> bool {
        self.active[carrier]
    }

    pub fn set(&mut self, carrier: usize, active: bool) {
        self.active[carrier] = active;
    }

    /// Number of active carriers
    pub fn count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// Indices of active carriers in ascending order
    pub fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(k, _)| k)
    }
}

impl std::fmt::Debug for ToneMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ToneMask({} active)", self.count())
    }
}

/// Fixed-length set of active SYNCP carriers
#[derive(Clone, PartialEq, Eq)]
pub struct SyncToneMask {
    active: [bool; N_SYNC_CARRIERS],
}

impl SyncToneMask {
    pub fn empty() -> Self {
        Self {
            active: [false; N_SYNC_CARRIERS],
        }
    }

    pub fn from_range(lo: usize, hi: usize) -> Self {
        let mut mask = Self::empty();
        for carrier in lo..=hi.min(N_SYNC_CARRIERS - 1) {
            mask.active[carrier] = true;
        }
        mask
    }

    pub fn is_active(&self, carrier: usize) -> bool {
        self.active[carrier]
    }

    pub fn count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = usize> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(k, _)| k)
    }

    /// Expand to payload-carrier resolution: SYNCP carrier k coincides
    /// with payload carrier 8k
    pub fn expand(&self) -> ToneMask {
        let mut mask = ToneMask::empty();
        for k in self.iter_active() {
            mask.set(k * SYNC_CARRIER_SPACING, true);
        }
        mask
    }
}

impl std::fmt::Debug for SyncToneMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncToneMask({} active)", self.count())
    }
}

/// Per-carrier modulation assignment for payload symbols
#[derive(Clone, PartialEq, Eq)]
pub struct ToneMap {
    modulation: [Modulation; NUMBER_OF_CARRIERS],
}

impl ToneMap {
    /// All carriers nulled
    pub fn nulled() -> Self {
        Self {
            modulation: [Modulation::Nulled; NUMBER_OF_CARRIERS],
        }
    }

    /// Uniform modulation on every active carrier of `mask`
    pub fn uniform(mask: &ToneMask, modulation: Modulation) -> Self {
        let mut map = Self::nulled();
        for carrier in mask.iter_active() {
            map.modulation[carrier] = modulation;
        }
        map
    }

    pub fn get(&self, carrier: usize) -> Modulation {
        self.modulation[carrier]
    }

    pub fn set(&mut self, carrier: usize, modulation: Modulation) {
        self.modulation[carrier] = modulation;
    }

    /// Sum of bits per OFDM symbol over all carriers
    pub fn capacity(&self) -> usize {
        self.modulation.iter().map(|m| m.bits()).sum()
    }

    /// Per-carrier modulation codes for the MAC-facing tone map response
    pub fn to_codes(&self) -> Vec<u8> {
        self.modulation.iter().map(|&m| m as u8).collect()
    }

    /// Mask of carriers assigned a given modulation
    pub fn carriers_with(&self, modulation: Modulation) -> ToneMask {
        let mut mask = ToneMask::empty();
        for (k, &m) in self.modulation.iter().enumerate() {
            if m == modulation {
                mask.set(k, true);
            }
        }
        mask
    }
}

impl std::fmt::Debug for ToneMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ToneMap(capacity {})", self.capacity())
    }
}

/// Tone map with its derived capacity and code rate
#[derive(Debug, Clone, PartialEq)]
pub struct ToneInfo {
    pub tone_map: ToneMap,
    /// Bits per OFDM symbol, kept in sync with the tone map
    pub capacity: usize,
    pub rate: CodeRate,
}

impl ToneInfo {
    pub fn new(tone_map: ToneMap, rate: CodeRate) -> Self {
        let capacity = tone_map.capacity();
        Self {
            tone_map,
            capacity,
            rate,
        }
    }

    /// Recompute the capacity after a tone map change
    pub fn update_capacity(&mut self) {
        self.capacity = self.tone_map.capacity();
    }
}
