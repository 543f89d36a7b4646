//! Channel and ROBO Interleavers
//!
//! The channel interleaver spreads the systematic and parity streams of
//! one encoded block over the symbol stream: each stream is read out
//! row-wise with a table-driven step and starting offset, then the two
//! readouts are merged in nibble groups, draining whichever stream is
//! left once the other runs out. The ROBO interleaver lays redundant
//! copies of the encoded stream onto disjoint carrier ranges of each
//! OFDM symbol.

use common::types::{CodeRate, PbSize, ToneMode};

/// Starting row offset, rows = PB size {16, 136, 520}, columns = rate
/// {1/2, 16/21, 16/18}
pub const CHANNEL_INTERLEAVER_OFFSET: [[usize; 3]; 3] = [
    [4, 4, 8],
    [8, 8, 16],
    [16, 16, 32],
];

/// Row step size, indexed like the offset table
pub const CHANNEL_INTERLEAVER_STEPSIZE: [[usize; 3]; 3] = [
    [8, 8, 16],
    [16, 16, 32],
    [32, 32, 64],
];

const NIBBLE: usize = 4;

fn table_params(pb_size: PbSize, rate: CodeRate) -> (usize, usize) {
    let row = pb_size.index();
    let col = rate.index();
    (
        CHANNEL_INTERLEAVER_OFFSET[row][col],
        CHANNEL_INTERLEAVER_STEPSIZE[row][col],
    )
}

/// Row-wise readout order of one stream: rows are visited starting at
/// `offset`, wrapping over all `step` rows; each row walks the stream
/// with stride `step`.
fn row_walk(len: usize, step: usize, offset: usize) -> impl Iterator<Item = usize> {
    (0..step)
        .map(move |j| (offset + j) % step)
        .flat_map(move |row| (row..len).step_by(step))
}

fn read_rows<T: Copy>(stream: &[T], step: usize, offset: usize) -> Vec<T> {
    row_walk(stream.len(), step, offset)
        .map(|i| stream[i])
        .collect()
}

fn write_rows<T: Copy + Default>(readout: &[T], step: usize, offset: usize) -> Vec<T> {
    let mut out = vec![T::default(); readout.len()];
    for (k, i) in row_walk(readout.len(), step, offset).enumerate() {
        out[i] = readout[k];
    }
    out
}

/// Nibble-merge schedule: how many elements to draw from stream A at
/// each turn, given both stream lengths
fn merge_take_a(n_a: usize, n_b: usize) -> impl Iterator<Item = (usize, usize)> {
    // Yields (from_a, from_b) chunk sizes until both streams drain
    let mut rem_a = n_a;
    let mut rem_b = n_b;
    std::iter::from_fn(move || {
        if rem_a == 0 && rem_b == 0 {
            return None;
        }
        let take_a = rem_a.min(NIBBLE);
        let take_b = rem_b.min(NIBBLE);
        rem_a -= take_a;
        rem_b -= take_b;
        Some((take_a, take_b))
    })
}

/// Interleave the systematic and parity streams of one encoded block
pub fn channel_interleaver<T: Copy + Default>(
    info: &[T],
    parity: &[T],
    pb_size: PbSize,
    rate: CodeRate,
) -> Vec<T> {
    let (offset, step) = table_params(pb_size, rate);
    let a = read_rows(info, step, offset);
    let b = read_rows(parity, step, offset);

    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut pos_a = 0;
    let mut pos_b = 0;
    for (take_a, take_b) in merge_take_a(a.len(), b.len()) {
        out.extend_from_slice(&a[pos_a..pos_a + take_a]);
        out.extend_from_slice(&b[pos_b..pos_b + take_b]);
        pos_a += take_a;
        pos_b += take_b;
    }
    out
}

/// Exact inverse of [`channel_interleaver`]; `n_info` is the systematic
/// stream length
pub fn channel_deinterleaver<T: Copy + Default>(
    stream: &[T],
    n_info: usize,
    pb_size: PbSize,
    rate: CodeRate,
) -> (Vec<T>, Vec<T>) {
    let (offset, step) = table_params(pb_size, rate);
    let n_parity = stream.len() - n_info;

    let mut a = Vec::with_capacity(n_info);
    let mut b = Vec::with_capacity(n_parity);
    let mut pos = 0;
    for (take_a, take_b) in merge_take_a(n_info, n_parity) {
        a.extend_from_slice(&stream[pos..pos + take_a]);
        pos += take_a;
        b.extend_from_slice(&stream[pos..pos + take_b]);
        pos += take_b;
    }

    (
        write_rows(&a, step, offset),
        write_rows(&b, step, offset),
    )
}

/// ROBO copier parameters, fully determined by the tone mode and the raw
/// encoded bit count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoboParams {
    pub n_copies: usize,
    pub bits_in_last_symbol: usize,
    pub bits_in_segment: usize,
    pub n_pad: usize,
}

/// Compute the copier layout for `n_raw` encoded bits over `n_carriers`
/// QPSK broadcast carriers
pub fn calc_robo_parameters(mode: ToneMode, n_raw: usize, n_carriers: usize) -> RoboParams {
    let n_copies = mode.n_copies();
    let carriers_per_copy = n_carriers / n_copies;
    let bits_in_segment = 2 * carriers_per_copy;
    let n_symbols = n_raw.div_ceil(bits_in_segment);
    let n_pad = n_symbols * bits_in_segment - n_raw;
    let bits_in_last_symbol = n_raw - (n_symbols - 1) * bits_in_segment;
    RoboParams {
        n_copies,
        bits_in_last_symbol,
        bits_in_segment,
        n_pad,
    }
}

/// Source index within a segment for output bit `j` of one symbol: copy
/// c reads the segment cyclically shifted by c * (segment / n_copies),
/// so copies land on disjoint carriers.
#[inline]
fn copier_source(j: usize, segment: usize, n_copies: usize) -> usize {
    let copy = j / segment;
    (j % segment + copy * (segment / n_copies)) % segment
}

/// Spread an encoded stream into its redundant per-symbol copy schedule
pub fn robo_interleaver(bits: &[bool], mode: ToneMode, n_carriers: usize) -> Vec<bool> {
    let params = calc_robo_parameters(mode, bits.len(), n_carriers);
    let segment = params.bits_in_segment;
    let n_symbols = (bits.len() + params.n_pad) / segment;
    let bits_per_symbol = 2 * n_carriers;

    let mut padded = bits.to_vec();
    padded.resize(bits.len() + params.n_pad, false);

    let mut out = Vec::with_capacity(n_symbols * bits_per_symbol);
    for sym in 0..n_symbols {
        let chunk = &padded[sym * segment..(sym + 1) * segment];
        for j in 0..bits_per_symbol {
            out.push(chunk[copier_source(j, segment, params.n_copies)]);
        }
    }
    out
}

/// Fold the soft bits of the redundant copies back into one stream of
/// `n_raw` values
pub fn robo_deinterleaver(
    soft: &[f32],
    n_raw: usize,
    mode: ToneMode,
    n_carriers: usize,
) -> Vec<f32> {
    let params = calc_robo_parameters(mode, n_raw, n_carriers);
    let segment = params.bits_in_segment;
    let bits_per_symbol = 2 * n_carriers;
    let n_symbols = soft.len() / bits_per_symbol;

    let mut combined = Vec::with_capacity(n_symbols * segment);
    for sym in 0..n_symbols {
        let symbol = &soft[sym * bits_per_symbol..(sym + 1) * bits_per_symbol];
        let mut acc = vec![0.0f32; segment];
        for (j, &llr) in symbol.iter().enumerate() {
            acc[copier_source(j, segment, params.n_copies)] += llr;
        }
        combined.extend_from_slice(&acc);
    }
    combined.truncate(n_raw);
    combined
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bits(n: usize) -> Vec<bool> {
        (0..n).map(|i| (i * 13 + 5) % 7 < 3).collect()
    }

    #[test]
    fn test_channel_interleaver_round_trip() {
        // Stream lengths representative of the encoded block shapes
        for (pb, n_info, n_parity) in [
            (PbSize::Pb16, 158, 158),
            (PbSize::Pb136, 1118, 361),
            (PbSize::Pb520, 4190, 529),
        ] {
            for rate in [CodeRate::Rate1_2, CodeRate::Rate16_21, CodeRate::Rate16_18] {
                let info = test_bits(n_info);
                let parity = test_bits(n_parity);
                let merged = channel_interleaver(&info, &parity, pb, rate);
                assert_eq!(merged.len(), n_info + n_parity);
                let (info2, parity2) = channel_deinterleaver(&merged, n_info, pb, rate);
                assert_eq!(info2, info, "pb={:?} rate={:?}", pb, rate);
                assert_eq!(parity2, parity, "pb={:?} rate={:?}", pb, rate);
            }
        }
    }

    #[test]
    fn test_channel_interleaver_moves_bits() {
        let info = test_bits(158);
        let parity = vec![false; 158];
        let merged = channel_interleaver(&info, &parity, PbSize::Pb16, CodeRate::Rate1_2);
        // The systematic stream must not come out in natural order
        let head: Vec<bool> = merged.iter().copied().take(8).collect();
        assert_ne!(head, info[..8].to_vec());
    }

    #[test]
    fn test_robo_parameters() {
        let params = calc_robo_parameters(ToneMode::StdRobo, 8380, 1028);
        assert_eq!(params.n_copies, 4);
        assert_eq!(params.bits_in_segment, 514);
        assert_eq!(params.n_pad, 17 * 514 - 8380);
        assert_eq!(params.bits_in_last_symbol, 8380 - 16 * 514);
    }

    #[test]
    fn test_robo_copies_disjoint_carriers() {
        // Within the first n_copies segments of one symbol, every source
        // bit appears exactly once per copy
        let segment = 514;
        let n_copies = 4;
        for copy in 0..n_copies {
            let mut seen = vec![false; segment];
            for j in copy * segment..(copy + 1) * segment {
                let src = copier_source(j, segment, n_copies);
                assert!(!seen[src]);
                seen[src] = true;
            }
        }
    }

    #[test]
    fn test_robo_round_trip() {
        for mode in [ToneMode::MiniRobo, ToneMode::StdRobo, ToneMode::HsRobo] {
            let bits = test_bits(2236);
            let spread = robo_interleaver(&bits, mode, 1028);
            assert_eq!(spread.len() % (2 * 1028), 0);
            let soft: Vec<f32> = spread.iter().map(|&b| if b { -1.0 } else { 1.0 }).collect();
            let folded = robo_deinterleaver(&soft, bits.len(), mode, 1028);
            let hard: Vec<bool> = folded.iter().map(|&l| l < 0.0).collect();
            assert_eq!(hard, bits, "mode={:?}", mode);
        }
    }
}
