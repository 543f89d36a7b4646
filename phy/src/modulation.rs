//! QAM Mapper and Soft Demapper
//!
//! Rectangular Gray-coded constellations for every supported modulation.
//! Bits are consumed LSB-first per carrier, the in-phase dimension takes
//! the extra bit for odd constellations. The demapper produces max-log
//! log-likelihood ratios; positive values mean bit 0.

use common::types::Modulation;
use num_complex::Complex32;

/// Per-modulation mapping parameters: bits per carrier and the amplitude
/// scale normalizing the constellation to unit average energy
#[derive(Debug, Clone, Copy)]
pub struct ModulationParams {
    pub n_bits: usize,
    pub scale: f32,
}

/// Indexed by the `Modulation` discriminant
pub const MODULATION_MAP: [ModulationParams; 9] = [
    ModulationParams { n_bits: 0, scale: 0.0 },          // Nulled
    ModulationParams { n_bits: 1, scale: 1.0 },          // BPSK
    ModulationParams { n_bits: 2, scale: 0.70710677 },   // QPSK, 1/sqrt(2)
    ModulationParams { n_bits: 3, scale: 0.40824828 },   // QAM-8, 1/sqrt(6)
    ModulationParams { n_bits: 4, scale: 0.31622776 },   // QAM-16, 1/sqrt(10)
    ModulationParams { n_bits: 6, scale: 0.15430336 },   // QAM-64, 1/sqrt(42)
    ModulationParams { n_bits: 8, scale: 0.07669650 },   // QAM-256, 1/sqrt(170)
    ModulationParams { n_bits: 10, scale: 0.03829193 },  // QAM-1024, 1/sqrt(682)
    ModulationParams { n_bits: 12, scale: 0.01913901 },  // QAM-4096, 1/sqrt(2730)
];

pub fn params(modulation: Modulation) -> ModulationParams {
    MODULATION_MAP[modulation as usize]
}

/// Bits on the in-phase dimension; the quadrature takes the rest
#[inline]
fn i_bits(n_bits: usize) -> usize {
    n_bits.div_ceil(2)
}

#[inline]
fn binary_to_gray(u: usize) -> usize {
    u ^ (u >> 1)
}

#[inline]
fn gray_to_binary(mut v: usize) -> usize {
    v ^= v >> 1;
    v ^= v >> 2;
    v ^= v >> 4;
    v
}

/// Amplitude of PAM level carrying data value `v` over `l` bits; data
/// zero sits at the most positive level
#[inline]
fn pam_amplitude(v: usize, l: usize) -> f32 {
    let levels = 1usize << l;
    let u = gray_to_binary(v);
    (levels as i32 - 1 - 2 * u as i32) as f32
}

/// Gray integer demap: data bits carried by level index `u`
#[inline]
pub fn qam_demodulate(u: usize, _l: usize) -> usize {
    binary_to_gray(u)
}

/// Map one carrier's bit group onto a constellation point
///
/// `bits` holds exactly the modulation's bit count, LSB first.
pub fn map_bits(bits: &[bool], modulation: Modulation) -> Complex32 {
    let p = params(modulation);
    debug_assert_eq!(bits.len(), p.n_bits);
    if p.n_bits == 0 {
        return Complex32::new(0.0, 0.0);
    }
    let n_i = i_bits(p.n_bits);
    let n_q = p.n_bits - n_i;

    let mut vi = 0usize;
    for (j, &bit) in bits[..n_i].iter().enumerate() {
        vi |= (bit as usize) << j;
    }
    let re = pam_amplitude(vi, n_i) * p.scale;

    let im = if n_q > 0 {
        let mut vq = 0usize;
        for (j, &bit) in bits[n_i..].iter().enumerate() {
            vq |= (bit as usize) << j;
        }
        pam_amplitude(vq, n_q) * p.scale
    } else {
        0.0
    };

    Complex32::new(re, im)
}

/// Max-log soft bits of one PAM dimension
///
/// `r` is the received coordinate, `scale` the constellation scale and
/// `n0` the effective noise power after equalization. One value per bit
/// is appended to `out`, LSB first.
pub fn demodulate_soft_bits_helper(
    n_bits: usize,
    r: f32,
    scale: f32,
    n0: f32,
    out: &mut Vec<f32>,
) {
    let levels = 1usize << n_bits;
    let base = out.len();
    out.resize(base + n_bits, 0.0);

    let mut d0 = vec![f32::INFINITY; n_bits];
    let mut d1 = vec![f32::INFINITY; n_bits];
    for u in 0..levels {
        let amp = (levels as i32 - 1 - 2 * u as i32) as f32 * scale;
        let diff = r - amp;
        let dist = diff * diff;
        let v = qam_demodulate(u, n_bits);
        for b in 0..n_bits {
            if v >> b & 1 == 0 {
                if dist < d0[b] {
                    d0[b] = dist;
                }
            } else if dist < d1[b] {
                d1[b] = dist;
            }
        }
    }
    for b in 0..n_bits {
        out[base + b] = (d1[b] - d0[b]) / n0;
    }
}

/// Soft-demap one equalized carrier sample
pub fn demodulate_soft_bits(
    value: Complex32,
    modulation: Modulation,
    n0: f32,
    out: &mut Vec<f32>,
) {
    let p = params(modulation);
    if p.n_bits == 0 {
        return;
    }
    let n_i = i_bits(p.n_bits);
    let n_q = p.n_bits - n_i;
    demodulate_soft_bits_helper(n_i, value.re, p.scale, n0, out);
    if n_q > 0 {
        demodulate_soft_bits_helper(n_q, value.im, p.scale, n0, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODULATIONS: [Modulation; 8] = [
        Modulation::Bpsk,
        Modulation::Qpsk,
        Modulation::Qam8,
        Modulation::Qam16,
        Modulation::Qam64,
        Modulation::Qam256,
        Modulation::Qam1024,
        Modulation::Qam4096,
    ];

    #[test]
    fn test_gray_codes_are_inverse() {
        for u in 0..64 {
            assert_eq!(gray_to_binary(binary_to_gray(u)), u);
        }
    }

    #[test]
    fn test_gray_neighbors_differ_in_one_bit() {
        for u in 0..63usize {
            let diff = binary_to_gray(u) ^ binary_to_gray(u + 1);
            assert_eq!(diff.count_ones(), 1);
        }
    }

    #[test]
    fn test_unit_average_energy() {
        for m in ALL_MODULATIONS {
            let p = params(m);
            let mut energy = 0.0f64;
            let points = 1usize << p.n_bits;
            for v in 0..points {
                let bits: Vec<bool> = (0..p.n_bits).map(|b| v >> b & 1 != 0).collect();
                let point = map_bits(&bits, m);
                energy += point.norm_sqr() as f64;
            }
            let avg = energy / points as f64;
            assert!((avg - 1.0).abs() < 1e-3, "{:?}: avg energy {}", m, avg);
        }
    }

    #[test]
    fn test_soft_demap_round_trip() {
        for m in ALL_MODULATIONS {
            let p = params(m);
            for v in 0..1usize << p.n_bits {
                let bits: Vec<bool> = (0..p.n_bits).map(|b| v >> b & 1 != 0).collect();
                let point = map_bits(&bits, m);
                let mut soft = Vec::new();
                demodulate_soft_bits(point, m, 1e-9, &mut soft);
                assert_eq!(soft.len(), p.n_bits);
                let hard: Vec<bool> = soft.iter().map(|&l| l < 0.0).collect();
                assert_eq!(hard, bits, "{:?} v={}", m, v);
            }
        }
    }

    #[test]
    fn test_nulled_carrier_maps_to_zero() {
        let point = map_bits(&[], Modulation::Nulled);
        assert_eq!(point, Complex32::new(0.0, 0.0));
        let mut soft = Vec::new();
        demodulate_soft_bits(point, Modulation::Nulled, 1.0, &mut soft);
        assert!(soft.is_empty());
    }

    #[test]
    fn test_llr_sign_convention() {
        // A strongly positive BPSK sample is bit 0
        let mut soft = Vec::new();
        demodulate_soft_bits(Complex32::new(1.0, 0.0), Modulation::Bpsk, 0.1, &mut soft);
        assert!(soft[0] > 0.0);
        soft.clear();
        demodulate_soft_bits(Complex32::new(-1.0, 0.0), Modulation::Bpsk, 0.1, &mut soft);
        assert!(soft[0] < 0.0);
    }
}
