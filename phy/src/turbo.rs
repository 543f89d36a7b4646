//! Turbo Codec
//!
//! Punctured parallel-concatenated convolutional code protecting payload
//! blocks and frame control. Two recursive systematic constituent
//! encoders (constraint length 4, feedback 0o13, feedforward 0o15) run on
//! the natural and QPP-interleaved bit orders; the parity streams are
//! punctured to reach the 1/2, 16/21 and 16/18 code rates. Decoding is
//! iterative max-log-MAP.
//!
//! Positive soft-bit values mean bit 0 throughout.

use crate::PhyError;
use common::types::CodeRate;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fixed decoder iteration count
pub const TURBO_ITERATIONS: usize = 8;

/// Constituent encoder memory
const MEMORY: usize = 3;
const N_STATES: usize = 1 << MEMORY;
/// Tail bits appended per block: 3 systematic/parity pairs per encoder
const TAIL_BITS: usize = 4 * MEMORY;

/// QPP turbo interleavers pi(i) = (f1*i + f2*i^2) mod n per block length.
/// Block lengths are the payload turbo inputs 8*(pb_size+3) and the
/// 128-bit frame control path. Each (f1, f2) pair satisfies the QPP
/// bijectivity conditions for its n.
const QPP_PARAMS: &[(usize, usize, usize)] = &[
    (128, 15, 32),
    (152, 13, 76),
    (1112, 171, 278),
    (4184, 15, 1046),
];

/// Parity positions kept per 16-bit group, by code rate
fn parity_kept(rate: CodeRate, index: usize) -> bool {
    match rate {
        CodeRate::Rate1_2 => true,
        CodeRate::Rate16_21 => matches!(index % 16, 0 | 3 | 6 | 9 | 12),
        CodeRate::Rate16_18 => matches!(index % 16, 0 | 8),
    }
}

fn kept_parity_count(rate: CodeRate, n: usize) -> usize {
    match rate {
        CodeRate::Rate1_2 => n,
        _ => (0..n).filter(|&i| parity_kept(rate, i)).count(),
    }
}

/// Encoded bit count for a turbo input of `n_info` bits
pub fn calc_encoded_block_size(rate: CodeRate, n_info: usize) -> usize {
    n_info + kept_parity_count(rate, n_info) + TAIL_BITS
}

/// Systematic and parity output streams of one encoded block
#[derive(Debug, Clone)]
pub struct TurboEncoded {
    pub info: Vec<bool>,
    pub parity: Vec<bool>,
}

/// One constituent RSC step: feedback d ^ s1 ^ s2, parity fb ^ s0 ^ s2
#[inline]
fn rsc_step(state: u8, input: bool) -> (u8, bool) {
    let fb = input as u8 ^ ((state >> 1) & 1) ^ (state & 1);
    let parity = fb ^ ((state >> 2) & 1) ^ (state & 1);
    let next = ((fb << 2) | (state >> 1)) & (N_STATES as u8 - 1);
    (next, parity != 0)
}

/// Tail input driving the feedback to zero
#[inline]
fn rsc_tail_input(state: u8) -> bool {
    (((state >> 1) & 1) ^ (state & 1)) != 0
}

/// Turbo codec with precomputed interleaver sequences
///
/// The sequences are immutable after construction and shared across
/// clones of the owning service.
#[derive(Debug, Clone)]
pub struct TurboCodec {
    sequences: Arc<BTreeMap<usize, Vec<usize>>>,
}

impl TurboCodec {
    pub fn new() -> Self {
        let mut sequences = BTreeMap::new();
        for &(n, f1, f2) in QPP_PARAMS {
            let seq: Vec<usize> = (0..n).map(|i| (f1 * i + f2 * i * i) % n).collect();
            sequences.insert(n, seq);
        }
        Self {
            sequences: Arc::new(sequences),
        }
    }

    fn sequence(&self, n: usize) -> Result<&[usize], PhyError> {
        self.sequences
            .get(&n)
            .map(|s| s.as_slice())
            .ok_or_else(|| {
                PhyError::InvalidConfiguration(format!("no turbo interleaver for {} bits", n))
            })
    }

    /// Encode one block
    pub fn encode(&self, data: &[bool], rate: CodeRate) -> Result<TurboEncoded, PhyError> {
        let n = data.len();
        let seq = self.sequence(n)?;

        let interleaved: Vec<bool> = seq.iter().map(|&pi| data[pi]).collect();

        let (parity1, tail1) = Self::encode_rsc(data);
        let (parity2, tail2) = Self::encode_rsc(&interleaved);

        let mut info = Vec::with_capacity(n + 2 * MEMORY);
        info.extend_from_slice(data);
        info.extend(tail1.iter().map(|&(sys, _)| sys));
        info.extend(tail2.iter().map(|&(sys, _)| sys));

        let mut parity = Vec::with_capacity(kept_parity_count(rate, n) + 2 * MEMORY);
        let mut kept = 0usize;
        for i in 0..n {
            if parity_kept(rate, i) {
                parity.push(if kept % 2 == 0 { parity1[i] } else { parity2[i] });
                kept += 1;
            }
        }
        parity.extend(tail1.iter().map(|&(_, par)| par));
        parity.extend(tail2.iter().map(|&(_, par)| par));

        Ok(TurboEncoded { info, parity })
    }

    /// One constituent encoder pass: parity bits plus the termination
    /// (systematic, parity) tail pairs
    fn encode_rsc(data: &[bool]) -> (Vec<bool>, [(bool, bool); MEMORY]) {
        let mut state = 0u8;
        let mut parity = Vec::with_capacity(data.len());
        for &bit in data {
            let (next, p) = rsc_step(state, bit);
            parity.push(p);
            state = next;
        }
        let mut tail = [(false, false); MEMORY];
        for entry in tail.iter_mut() {
            let sys = rsc_tail_input(state);
            let (next, p) = rsc_step(state, sys);
            *entry = (sys, p);
            state = next;
        }
        debug_assert_eq!(state, 0);
        (parity, tail)
    }

    /// Decode one block from soft information
    ///
    /// `info_llr` carries the systematic bits followed by both tails,
    /// `parity_llr` the punctured parity followed by both parity tails,
    /// matching the encoder output layout.
    pub fn decode(
        &self,
        info_llr: &[f32],
        parity_llr: &[f32],
        rate: CodeRate,
    ) -> Result<Vec<bool>, PhyError> {
        if info_llr.len() < 2 * MEMORY {
            return Err(PhyError::ProcessingError(
                "turbo block shorter than the tails".into(),
            ));
        }
        let n = info_llr.len() - 2 * MEMORY;
        let seq = self.sequence(n)?;
        let kept = kept_parity_count(rate, n);
        if parity_llr.len() != kept + 2 * MEMORY {
            return Err(PhyError::ProcessingError(format!(
                "parity stream length {} does not match rate (expected {})",
                parity_llr.len(),
                kept + 2 * MEMORY
            )));
        }

        let sys = &info_llr[..n];
        let tail1_sys = &info_llr[n..n + MEMORY];
        let tail2_sys = &info_llr[n + MEMORY..n + 2 * MEMORY];

        // Depuncture: zero soft value where the encoder dropped parity
        let mut p1 = vec![0.0f32; n + MEMORY];
        let mut p2 = vec![0.0f32; n + MEMORY];
        let mut kept_idx = 0usize;
        for i in 0..n {
            if parity_kept(rate, i) {
                if kept_idx % 2 == 0 {
                    p1[i] = parity_llr[kept_idx];
                } else {
                    p2[i] = parity_llr[kept_idx];
                }
                kept_idx += 1;
            }
        }
        p1[n..].copy_from_slice(&parity_llr[kept..kept + MEMORY]);
        p2[n..].copy_from_slice(&parity_llr[kept + MEMORY..kept + 2 * MEMORY]);

        let mut sys1 = Vec::with_capacity(n + MEMORY);
        sys1.extend_from_slice(sys);
        sys1.extend_from_slice(tail1_sys);

        let mut sys2: Vec<f32> = seq.iter().map(|&pi| sys[pi]).collect();
        sys2.extend_from_slice(tail2_sys);

        let mut apriori1 = vec![0.0f32; n];
        let mut apriori2 = vec![0.0f32; n];
        for _ in 0..TURBO_ITERATIONS {
            let ext1 = max_log_map(&sys1, &p1, &apriori1, n);
            for (i, &pi) in seq.iter().enumerate() {
                apriori2[i] = ext1[pi];
            }
            let ext2 = max_log_map(&sys2, &p2, &apriori2, n);
            for (i, &pi) in seq.iter().enumerate() {
                apriori1[pi] = ext2[i];
            }
        }

        // Final half-iteration for the a posteriori decision
        let ext1 = max_log_map(&sys1, &p1, &apriori1, n);
        let bits = (0..n)
            .map(|i| sys[i] + apriori1[i] + ext1[i] < 0.0)
            .collect();
        Ok(bits)
    }
}

impl Default for TurboCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Max-log BCJR over one terminated constituent code
///
/// `sys`/`par` cover the data and tail steps; `apriori` covers only the
/// first `n` data steps. Returns the extrinsic values for those steps.
fn max_log_map(sys: &[f32], par: &[f32], apriori: &[f32], n: usize) -> Vec<f32> {
    let steps = sys.len();
    const NEG: f32 = f32::NEG_INFINITY;

    // Branch metric for hypothesis bit d with parity p:
    // positive soft value favors bit 0.
    #[inline]
    fn branch(soft_sys: f32, soft_par: f32, d: bool, p: bool) -> f32 {
        let s = if d { -0.5 * soft_sys } else { 0.5 * soft_sys };
        let q = if p { -0.5 * soft_par } else { 0.5 * soft_par };
        s + q
    }

    // Forward recursion
    let mut alpha = vec![[NEG; N_STATES]; steps + 1];
    alpha[0][0] = 0.0;
    for k in 0..steps {
        let la = if k < n { apriori[k] } else { 0.0 };
        for s in 0..N_STATES {
            let a = alpha[k][s];
            if a == NEG {
                continue;
            }
            for d in [false, true] {
                let (next, p) = rsc_step(s as u8, d);
                let m = a + branch(sys[k] + la, par[k], d, p);
                if m > alpha[k + 1][next as usize] {
                    alpha[k + 1][next as usize] = m;
                }
            }
        }
    }

    // Backward recursion from the terminated zero state
    let mut beta = vec![[NEG; N_STATES]; steps + 1];
    beta[steps][0] = 0.0;
    for k in (0..steps).rev() {
        let la = if k < n { apriori[k] } else { 0.0 };
        for s in 0..N_STATES {
            let mut best = NEG;
            for d in [false, true] {
                let (next, p) = rsc_step(s as u8, d);
                let b = beta[k + 1][next as usize];
                if b == NEG {
                    continue;
                }
                let m = b + branch(sys[k] + la, par[k], d, p);
                if m > best {
                    best = m;
                }
            }
            beta[k][s] = best;
        }
    }

    // A posteriori bit metrics and extrinsic output
    let mut extrinsic = vec![0.0f32; n];
    for k in 0..n {
        let la = apriori[k];
        let mut m0 = NEG;
        let mut m1 = NEG;
        for s in 0..N_STATES {
            let a = alpha[k][s];
            if a == NEG {
                continue;
            }
            for d in [false, true] {
                let (next, p) = rsc_step(s as u8, d);
                let b = beta[k + 1][next as usize];
                if b == NEG {
                    continue;
                }
                let m = a + branch(sys[k] + la, par[k], d, p) + b;
                if d {
                    if m > m1 {
                        m1 = m;
                    }
                } else if m > m0 {
                    m0 = m;
                }
            }
        }
        let app = m0 - m1;
        extrinsic[k] = app - sys[k] - la;
    }
    extrinsic
}
