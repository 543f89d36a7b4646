//! FFT Engine
//!
//! Real-to-complex transforms for payload symbols and SYNCP symbols.
//! Plan construction is serialized by a single process-wide planner lock;
//! once built, plans are instance-private and execute without locking, so
//! independent engine instances may transform concurrently. Forward and
//! inverse transforms are both scaled by 1/sqrt(len), making them exact
//! inverses of each other.

use crate::PhyError;
use common::ieee1901::{FFT_SIZE, NUMBER_OF_CARRIERS, N_SYNC_CARRIERS, SYNCP_SIZE};
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::{Arc, Mutex, OnceLock};

/// Process-wide FFT planner; held only while plans are created
fn planner() -> &'static Mutex<RealFftPlanner<f32>> {
    static PLANNER: OnceLock<Mutex<RealFftPlanner<f32>>> = OnceLock::new();
    PLANNER.get_or_init(|| Mutex::new(RealFftPlanner::new()))
}

/// One direction pair of plans for a given transform length
#[derive(Clone)]
struct PlanPair {
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    len: usize,
}

impl PlanPair {
    fn new(len: usize) -> Result<Self, PhyError> {
        if len == 0 || len % 2 != 0 {
            return Err(PhyError::InitializationFailed(format!(
                "invalid FFT length {}",
                len
            )));
        }
        // Scoped acquisition: the lock is released on every exit path
        let (forward, inverse) = {
            let mut planner = planner()
                .lock()
                .map_err(|_| PhyError::InitializationFailed("FFT planner poisoned".into()))?;
            (planner.plan_fft_forward(len), planner.plan_fft_inverse(len))
        };
        Ok(Self {
            forward,
            inverse,
            len,
        })
    }
}

/// Payload and SYNCP transforms with reusable scratch buffers
#[derive(Clone)]
pub struct FftEngine {
    payload: PlanPair,
    syncp: PlanPair,
    time_scratch: Vec<f32>,
    freq_scratch: Vec<Complex32>,
}

impl FftEngine {
    pub fn new() -> Result<Self, PhyError> {
        Ok(Self {
            payload: PlanPair::new(FFT_SIZE)?,
            syncp: PlanPair::new(SYNCP_SIZE)?,
            time_scratch: vec![0.0; FFT_SIZE],
            freq_scratch: vec![Complex32::new(0.0, 0.0); FFT_SIZE / 2 + 1],
        })
    }

    fn forward(&mut self, use_payload: bool, time: &[f32], n_carriers: usize) -> Vec<Complex32> {
        let pair = if use_payload {
            &self.payload
        } else {
            &self.syncp
        };
        let plan = Arc::clone(&pair.forward);
        let len = pair.len;
        debug_assert_eq!(time.len(), len);
        let norm = 1.0 / (len as f32).sqrt();

        self.time_scratch[..len].copy_from_slice(time);
        let spectrum = &mut self.freq_scratch[..len / 2 + 1];
        // realfft never fails on matching buffer lengths
        let _ = plan.process(&mut self.time_scratch[..len], spectrum);
        spectrum[..n_carriers].iter().map(|&c| c * norm).collect()
    }

    fn inverse(&mut self, use_payload: bool, carriers: &[Complex32]) -> Vec<f32> {
        let pair = if use_payload {
            &self.payload
        } else {
            &self.syncp
        };
        let plan = Arc::clone(&pair.inverse);
        let len = pair.len;
        let bins = len / 2 + 1;
        debug_assert_eq!(carriers.len(), bins - 1);
        let norm = 1.0 / (len as f32).sqrt();

        let spectrum = &mut self.freq_scratch[..bins];
        spectrum[..carriers.len()].copy_from_slice(carriers);
        // DC must be purely real and the Nyquist bin is unused
        spectrum[0].im = 0.0;
        spectrum[bins - 1] = Complex32::new(0.0, 0.0);

        let mut time = vec![0.0f32; len];
        let _ = plan.process(spectrum, &mut time);
        for sample in time.iter_mut() {
            *sample *= norm;
        }
        time
    }

    /// Payload-resolution forward transform: `FFT_SIZE` samples to one
    /// complex value per carrier
    pub fn fft(&mut self, time: &[f32]) -> Vec<Complex32> {
        self.forward(true, time, NUMBER_OF_CARRIERS)
    }

    /// Payload-resolution inverse transform
    pub fn ifft(&mut self, carriers: &[Complex32]) -> Vec<f32> {
        self.inverse(true, carriers)
    }

    /// SYNCP-resolution forward transform
    pub fn fft_syncp(&mut self, time: &[f32]) -> Vec<Complex32> {
        self.forward(false, time, N_SYNC_CARRIERS)
    }

    /// SYNCP-resolution inverse transform
    pub fn ifft_syncp(&mut self, carriers: &[Complex32]) -> Vec<f32> {
        self.inverse(false, carriers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let mut engine = FftEngine::new().unwrap();
        let mut carriers = vec![Complex32::new(0.0, 0.0); NUMBER_OF_CARRIERS];
        carriers[100] = Complex32::new(1.0, 0.5);
        carriers[731] = Complex32::new(-0.3, 0.9);

        let time = engine.ifft(&carriers);
        assert_eq!(time.len(), FFT_SIZE);
        let back = engine.fft(&time);
        for (k, (&a, &b)) in carriers.iter().zip(back.iter()).enumerate() {
            assert!((a - b).norm() < 1e-4, "carrier {} differs: {} vs {}", k, a, b);
        }
    }

    #[test]
    fn test_syncp_round_trip() {
        let mut engine = FftEngine::new().unwrap();
        let mut carriers = vec![Complex32::new(0.0, 0.0); N_SYNC_CARRIERS];
        carriers[17] = Complex32::new(0.8, -0.6);

        let time = engine.ifft_syncp(&carriers);
        assert_eq!(time.len(), SYNCP_SIZE);
        let back = engine.fft_syncp(&time);
        assert!((back[17] - carriers[17]).norm() < 1e-5);
        assert!(back[16].norm() < 1e-5);
    }

    #[test]
    fn test_engines_are_independent() {
        // Two instances share no mutable state after construction
        let mut a = FftEngine::new().unwrap();
        let mut b = FftEngine::new().unwrap();
        let mut carriers = vec![Complex32::new(0.0, 0.0); NUMBER_OF_CARRIERS];
        carriers[5] = Complex32::new(1.0, 0.0);
        let ta = a.ifft(&carriers);
        let tb = b.ifft(&carriers);
        assert_eq!(ta, tb);
    }

    #[test]
    fn test_time_domain_output_is_real_scaled() {
        let mut engine = FftEngine::new().unwrap();
        let carriers = vec![Complex32::new(1.0, 0.0); NUMBER_OF_CARRIERS];
        let time = engine.ifft(&carriers);
        // Energy conservation under the 1/sqrt(len) convention: the
        // one-sided spectrum carries half the two-sided energy
        let energy: f32 = time.iter().map(|&x| x * x).sum();
        let expected = 2.0 * carriers.len() as f32;
        assert!((energy / expected - 1.0).abs() < 0.01, "energy {}", energy);
    }
}
