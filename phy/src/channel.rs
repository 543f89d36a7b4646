//! Channel Estimation and Tone-Map Selection
//!
//! Produces the per-carrier channel response from the preamble, from
//! sound MPDUs with known payload, or decision-directed from payload
//! carriers known to be QPSK. Noise PSD is estimated from inter-frame
//! space samples at SYNCP resolution. Tone-map selection assigns each
//! active carrier the highest modulation whose predicted symbol error
//! rate stays below the target.

use crate::fft::FftEngine;
use crate::preamble::Preamble;
use common::ieee1901::{NUMBER_OF_CARRIERS, N_SYNC_CARRIERS, SYNCP_SIZE, SYNC_CARRIER_SPACING};
use common::types::{Modulation, SyncToneMask, ToneMap, ToneMask};
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::debug;

/// Preamble SYNCP periods used for estimation: period 0 carries the
/// rolloff ramp and periods 7..9 straddle the phase inversion
const ESTIMATION_PERIODS: std::ops::Range<usize> = 1..7;

/// Floor applied to noise estimates to keep soft-bit scaling finite
pub const NOISE_FLOOR: f32 = 1e-9;

/// Per-carrier channel response
#[derive(Debug, Clone)]
pub struct ChannelResponse {
    /// Complex gains at payload-carrier resolution
    pub carriers: Vec<Complex32>,
    /// Real gains at SYNCP resolution
    pub sync_carriers: Vec<f32>,
    /// Real gains used to equalize the frame control symbol
    pub frame_control_carriers: Vec<f32>,
    /// Number of SYNCP periods behind the current estimate
    pub n_syncp_symbols: usize,
}

impl ChannelResponse {
    /// Unestimated flat response with unit gain
    pub fn flat() -> Self {
        Self {
            carriers: vec![Complex32::new(1.0, 0.0); NUMBER_OF_CARRIERS],
            sync_carriers: vec![1.0; N_SYNC_CARRIERS],
            frame_control_carriers: vec![1.0; NUMBER_OF_CARRIERS],
            n_syncp_symbols: 0,
        }
    }
}

/// Estimate the response from an aligned received preamble
pub fn estimate_from_preamble(
    samples: &[f32],
    reference: &Preamble,
    sync_mask: &SyncToneMask,
    response: &mut ChannelResponse,
    fft: &mut FftEngine,
) {
    debug_assert!(samples.len() >= ESTIMATION_PERIODS.end * SYNCP_SIZE);

    let mut acc = vec![Complex32::new(0.0, 0.0); N_SYNC_CARRIERS];
    let n_periods = ESTIMATION_PERIODS.len();
    for period in ESTIMATION_PERIODS {
        let window = &samples[period * SYNCP_SIZE..(period + 1) * SYNCP_SIZE];
        let spectrum = fft.fft_syncp(window);
        for (a, &x) in acc.iter_mut().zip(spectrum.iter()) {
            *a += x;
        }
    }

    let mut known_x = Vec::with_capacity(sync_mask.count());
    let mut known_h = Vec::with_capacity(sync_mask.count());
    for k in 0..N_SYNC_CARRIERS {
        if sync_mask.is_active(k) {
            let h = acc[k] / (n_periods as f32 * reference.syncp_freq[k]);
            response.sync_carriers[k] = h.norm();
            known_x.push((k * SYNC_CARRIER_SPACING) as f32);
            known_h.push(h);
        } else {
            response.sync_carriers[k] = 0.0;
        }
    }

    // Linear interpolation of the complex gains onto payload carriers
    for j in 0..NUMBER_OF_CARRIERS {
        let h = interpolate_complex(&known_x, &known_h, j as f32);
        response.carriers[j] = h;
        response.frame_control_carriers[j] = h.norm();
    }
    response.n_syncp_symbols = n_periods;
    debug!(
        "preamble channel estimate over {} SYNCP periods",
        n_periods
    );
}

/// Estimate the response from a sound MPDU: received payload spectra
/// against the regenerated reference spectra
pub fn estimate_from_sound(
    rx_symbols: &[Vec<Complex32>],
    ref_symbols: &[Vec<Complex32>],
    tone_mask: &ToneMask,
    response: &mut ChannelResponse,
) {
    debug_assert_eq!(rx_symbols.len(), ref_symbols.len());
    for k in tone_mask.iter_active() {
        let mut acc = Complex32::new(0.0, 0.0);
        let mut count = 0usize;
        for (rx, reference) in rx_symbols.iter().zip(ref_symbols.iter()) {
            if reference[k].norm_sqr() > 1e-12 {
                acc += rx[k] / reference[k];
                count += 1;
            }
        }
        if count > 0 {
            response.carriers[k] = acc / count as f32;
        }
    }
    debug!("sound channel estimate over {} symbols", rx_symbols.len());
}

/// Decision-directed re-estimation from payload carriers known to be
/// QPSK, interpolated over the remaining active carriers: cubic spline
/// for the magnitude, linear for the unwrapped phase.
pub fn estimate_from_payload_qpsk(
    rx_symbols: &[Vec<Complex32>],
    qpsk_mask: &ToneMask,
    tone_mask: &ToneMask,
    response: &mut ChannelResponse,
) {
    if rx_symbols.is_empty() || qpsk_mask.count() < 2 {
        return;
    }

    let mut known_x = Vec::with_capacity(qpsk_mask.count());
    let mut known_h = Vec::with_capacity(qpsk_mask.count());
    for k in qpsk_mask.iter_active() {
        let mut acc = Complex32::new(0.0, 0.0);
        for rx in rx_symbols {
            // Remove the QPSK decision taken against the prior estimate
            let eq = rx[k] / response.carriers[k];
            let decision = Complex32::new(
                if eq.re >= 0.0 { 1.0 } else { -1.0 },
                if eq.im >= 0.0 { 1.0 } else { -1.0 },
            ) * std::f32::consts::FRAC_1_SQRT_2;
            acc += rx[k] * decision.conj();
        }
        known_x.push(k as f32);
        known_h.push(acc / rx_symbols.len() as f32);
    }

    let magnitudes: Vec<f32> = known_h.iter().map(|h| h.norm()).collect();
    let phases = phase_unwrap(&known_h.iter().map(|h| h.arg()).collect::<Vec<_>>());

    let mag_spline = spline(&known_x, &magnitudes);
    let phase_lines = linear(&known_x, &phases);

    for k in tone_mask.iter_active() {
        let x = k as f32;
        let mag = spline_interpolate(&mag_spline, x).max(0.0);
        let phase = linear_interpolate(&phase_lines, x);
        response.carriers[k] = Complex32::from_polar(mag, phase);
    }
    debug!(
        "payload QPSK channel estimate from {} carriers over {} symbols",
        known_x.len(),
        rx_symbols.len()
    );
}

/// Per-carrier noise PSD from inter-frame-space samples, measured at
/// SYNCP resolution and expanded to payload carriers
pub fn estimate_noise_psd(samples: &[f32], fft: &mut FftEngine) -> Vec<f32> {
    let n_chunks = samples.len() / SYNCP_SIZE;
    let mut sync_psd = vec![0.0f32; N_SYNC_CARRIERS];
    for chunk in 0..n_chunks {
        let window = &samples[chunk * SYNCP_SIZE..(chunk + 1) * SYNCP_SIZE];
        let spectrum = fft.fft_syncp(window);
        for (p, &x) in sync_psd.iter_mut().zip(spectrum.iter()) {
            *p += x.norm_sqr();
        }
    }
    if n_chunks > 0 {
        for p in sync_psd.iter_mut() {
            *p /= n_chunks as f32;
        }
    }

    (0..NUMBER_OF_CARRIERS)
        .map(|j| sync_psd[j / SYNC_CARRIER_SPACING].max(NOISE_FLOOR))
        .collect()
}

/// Per-carrier SNR over the active tone mask
pub fn snr_vector(
    response: &ChannelResponse,
    noise_psd: &[f32],
    tone_mask: &ToneMask,
) -> Vec<f32> {
    tone_mask
        .iter_active()
        .map(|k| 2.0 * response.carriers[k].norm_sqr() / noise_psd[k].max(NOISE_FLOOR))
        .collect()
}

/// Closed-form symbol error rate of a modulation at a given SNR
pub fn calc_ser(modulation: Modulation, snr: f32) -> f32 {
    let n_bits = modulation.bits();
    if n_bits == 0 {
        return 0.0;
    }
    let l1 = 1usize << n_bits.div_ceil(2);
    let l2 = 1usize << (n_bits / 2);
    let es = (l1 * l1 + l2 * l2 - 2) as f32 / 6.0;
    let arg = (snr / es).sqrt();
    let p1 = 2.0 * (1.0 - 1.0 / l1 as f32) * q_function(arg);
    let p2 = if l2 > 1 {
        2.0 * (1.0 - 1.0 / l2 as f32) * q_function(arg)
    } else {
        0.0
    };
    1.0 - (1.0 - p1) * (1.0 - p2)
}

/// Deterministic tone-map selection: the highest modulation whose
/// predicted SER stays at or below `target_ser`; carriers below the
/// BPSK threshold (or pinned by `force_mask`) are nulled.
pub fn select_tone_map(
    response: &ChannelResponse,
    noise_psd: &[f32],
    target_ser: f32,
    force_mask: Option<&ToneMask>,
    tone_mask: &ToneMask,
) -> ToneMap {
    const CANDIDATES: [Modulation; 8] = [
        Modulation::Qam4096,
        Modulation::Qam1024,
        Modulation::Qam256,
        Modulation::Qam64,
        Modulation::Qam16,
        Modulation::Qam8,
        Modulation::Qpsk,
        Modulation::Bpsk,
    ];

    let mut map = ToneMap::nulled();
    for k in tone_mask.iter_active() {
        if force_mask.map(|f| f.is_active(k)).unwrap_or(false) {
            continue;
        }
        let snr = 2.0 * response.carriers[k].norm_sqr() / noise_psd[k].max(NOISE_FLOOR);
        for &candidate in &CANDIDATES {
            if calc_ser(candidate, snr) <= target_ser {
                map.set(k, candidate);
                break;
            }
        }
    }
    map
}

/// Gaussian tail probability
fn q_function(x: f32) -> f32 {
    0.5 * erfc((x as f64) / std::f64::consts::SQRT_2) as f32
}

/// Complementary error function approximation.
fn erfc(x: f64) -> f64 {
    // Abramowitz & Stegun approximation 7.1.26
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let result = poly * (-x * x).exp();
    if x >= 0.0 {
        result
    } else {
        2.0 - result
    }
}

/// Unwrap a phase sequence so consecutive values never jump by more
/// than pi
pub fn phase_unwrap(phases: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(phases.len());
    let mut offset = 0.0f32;
    for (i, &p) in phases.iter().enumerate() {
        if i > 0 {
            let delta = p - phases[i - 1];
            if delta > PI {
                offset -= 2.0 * PI;
            } else if delta < -PI {
                offset += 2.0 * PI;
            }
        }
        out.push(p + offset);
    }
    out
}

/// One natural cubic spline segment starting at knot `x`
#[derive(Debug, Clone, Copy)]
pub struct SplineSet {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    x: f32,
}

/// Natural cubic spline through `(x, y)` knots; `x` must be ascending
pub fn spline(x: &[f32], y: &[f32]) -> Vec<SplineSet> {
    let n = x.len();
    debug_assert_eq!(n, y.len());
    if n < 2 {
        return Vec::new();
    }

    let h: Vec<f32> = (0..n - 1).map(|i| x[i + 1] - x[i]).collect();
    let mut alpha = vec![0.0f32; n];
    for i in 1..n - 1 {
        alpha[i] = 3.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
    }

    let mut l = vec![1.0f32; n];
    let mut mu = vec![0.0f32; n];
    let mut z = vec![0.0f32; n];
    for i in 1..n - 1 {
        l[i] = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
        mu[i] = h[i] / l[i];
        z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
    }

    let mut c = vec![0.0f32; n];
    let mut b = vec![0.0f32; n - 1];
    let mut d = vec![0.0f32; n - 1];
    for i in (0..n - 1).rev() {
        c[i] = z[i] - mu[i] * c[i + 1];
        b[i] = (y[i + 1] - y[i]) / h[i] - h[i] * (c[i + 1] + 2.0 * c[i]) / 3.0;
        d[i] = (c[i + 1] - c[i]) / (3.0 * h[i]);
    }

    (0..n - 1)
        .map(|i| SplineSet {
            a: y[i],
            b: b[i],
            c: c[i],
            d: d[i],
            x: x[i],
        })
        .collect()
}

/// Evaluate a spline at `x`, extrapolating with the edge segments
pub fn spline_interpolate(sets: &[SplineSet], x: f32) -> f32 {
    if sets.is_empty() {
        return 0.0;
    }
    let seg = match sets.iter().rposition(|s| s.x <= x) {
        Some(i) => &sets[i],
        None => &sets[0],
    };
    let dx = x - seg.x;
    seg.a + dx * (seg.b + dx * (seg.c + dx * seg.d))
}

/// One linear segment starting at knot `x`
#[derive(Debug, Clone, Copy)]
pub struct LinearSet {
    a: f32,
    b: f32,
    x: f32,
}

/// Piecewise linear fit through `(x, y)` knots
pub fn linear(x: &[f32], y: &[f32]) -> Vec<LinearSet> {
    let n = x.len();
    debug_assert_eq!(n, y.len());
    if n < 2 {
        return Vec::new();
    }
    (0..n - 1)
        .map(|i| LinearSet {
            a: y[i],
            b: (y[i + 1] - y[i]) / (x[i + 1] - x[i]),
            x: x[i],
        })
        .collect()
}

pub fn linear_interpolate(sets: &[LinearSet], x: f32) -> f32 {
    if sets.is_empty() {
        return 0.0;
    }
    let seg = match sets.iter().rposition(|s| s.x <= x) {
        Some(i) => &sets[i],
        None => &sets[0],
    };
    seg.a + (x - seg.x) * seg.b
}

/// Linear interpolation of complex samples at the given abscissa
fn interpolate_complex(xs: &[f32], hs: &[Complex32], x: f32) -> Complex32 {
    if xs.is_empty() {
        return Complex32::new(1.0, 0.0);
    }
    if x <= xs[0] {
        return hs[0];
    }
    if x >= xs[xs.len() - 1] {
        return hs[hs.len() - 1];
    }
    let i = xs.partition_point(|&v| v <= x) - 1;
    let t = (x - xs[i]) / (xs[i + 1] - xs[i]);
    hs[i] * (1.0 - t) + hs[i + 1] * t
}
