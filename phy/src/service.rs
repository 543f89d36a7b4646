//! PHY Service
//!
//! The transceiver engine: composes preamble, frame control and payload
//! symbols into a PPDU sample stream on transmit, and decodes aligned
//! sample windows back into MPDU bytes on receive. One instance owns its
//! FFT plans, turbo codec state, channel response and per-frame scratch;
//! the masks, preamble and turbo interleaver tables are immutable after
//! construction and shared across clones.

use crate::channel::{
    self, ChannelResponse, NOISE_FLOOR,
};
use crate::fft::FftEngine;
use crate::frame_control::{self, FrameControlFields};
use crate::interleaver::{
    calc_robo_parameters, channel_deinterleaver, channel_interleaver, robo_deinterleaver,
    robo_interleaver,
};
use crate::modulation::{demodulate_soft_bits, map_bits};
use crate::preamble::Preamble;
use crate::scrambler::{PnGenerator, Scrambler};
use crate::turbo::{calc_encoded_block_size, TurboCodec};
use crate::PhyError;
use bytes::Bytes;
use common::ieee1901::{
    default_broadcast_tone_mask, default_sync_tone_mask, default_tone_mask, FFT_SIZE,
    FRAME_CONTROL_BYTES, FRAME_CONTROL_NBITS, GUARD_INTERVAL_FC, GUARD_INTERVAL_PAYLOAD,
    MIN_INTERFRAME_SPACE, NUMBER_OF_CARRIERS, ROLLOFF_INTERVAL,
};
use common::types::{
    ChannelEstMode, CodeRate, DelimiterType, Modulation, PbSize, SyncToneMask, ToneInfo, ToneMap,
    ToneMask, ToneMode,
};
use common::utils::{crc24_append, crc24_check, pack_bits, unpack_bits};
use num_complex::Complex32;
use num_traits::FromPrimitive;
use std::f32::consts::PI;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Target symbol error rate of MAC-requested tone maps
pub const TONE_MAP_TARGET_SER: f32 = 0.01;
/// Code rate of the custom (standard-mode) tone map
const STANDARD_RATE: CodeRate = CodeRate::Rate16_21;
/// Upper bound on payload symbols per frame
const MAX_FRAME_SYMBOLS: usize = 4096;
/// Seed of the sound-frame reference payload generator
const SOUND_PN_SEED: u16 = 0x3A5;
/// Payload CRC-24 bytes appended to each physical block
const PB_CRC_BYTES: usize = 3;

/// Construction parameters of a [`PhyService`]
#[derive(Debug, Clone)]
pub struct PhyConfig {
    pub tone_mask: ToneMask,
    pub broadcast_tone_mask: ToneMask,
    pub sync_tone_mask: SyncToneMask,
    pub channel_est: ChannelEstMode,
}

impl Default for PhyConfig {
    fn default() -> Self {
        Self {
            tone_mask: default_tone_mask(),
            broadcast_tone_mask: default_broadcast_tone_mask(),
            sync_tone_mask: default_sync_tone_mask(),
            channel_est: ChannelEstMode::Preamble,
        }
    }
}

/// Receiver-side counters
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Frame control decode attempts
    pub frames_attempted: u64,
    /// Frame controls accepted
    pub frames_decoded: u64,
    /// Payload blocks run through the decoder
    pub blocks_decoded: u64,
    /// Payload blocks failing their CRC
    pub block_errors: u64,
    /// Post-decoder bit errors against the known sound reference
    pub bit_errors: u64,
    /// Most recent per-carrier SNR estimate
    pub last_snr: Vec<f32>,
}

/// Transmit parameters resolved from frame control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub tone_mode: ToneMode,
    pub pb_size: PbSize,
}

/// Receive parameters parsed from frame control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxParams {
    pub delimiter: DelimiterType,
    pub n_symbols: usize,
    pub n_blocks: usize,
    pub pb_size: PbSize,
    pub tone_mode: ToneMode,
    pub rate: CodeRate,
    /// Encoded bits per physical block
    pub fec_block_size: usize,
}

/// The PHY transceiver engine
#[derive(Clone)]
pub struct PhyService {
    tone_mask: Arc<ToneMask>,
    broadcast_tone_mask: Arc<ToneMask>,
    sync_tone_mask: Arc<SyncToneMask>,
    n_broadcast_tones: usize,
    channel_est_mode: ChannelEstMode,
    broadcast_qpsk_tone_info: ToneInfo,
    custom_tone_info: ToneInfo,
    qpsk_tone_mask: ToneMask,
    preamble: Arc<Preamble>,
    turbo: TurboCodec,
    fft: FftEngine,
    channel: ChannelResponse,
    noise_psd: Vec<f32>,
    rx_params: Option<RxParams>,
    rx_fields: Option<FrameControlFields>,
    // Per-frame scratch, reused across frames
    rx_symbols_freq: Vec<Vec<Complex32>>,
    rx_soft_bits: Vec<f32>,
    pub stats: Stats,
}

impl PhyService {
    pub fn new(config: PhyConfig) -> Result<Self, PhyError> {
        let n_broadcast_tones = config.broadcast_tone_mask.count();
        if n_broadcast_tones == 0 {
            return Err(PhyError::InvalidConfiguration(
                "broadcast tone mask is empty".into(),
            ));
        }
        for k in config.broadcast_tone_mask.iter_active() {
            if !config.tone_mask.is_active(k) {
                return Err(PhyError::InvalidConfiguration(format!(
                    "broadcast carrier {} outside the tone mask",
                    k
                )));
            }
        }
        if config.sync_tone_mask.count() == 0 {
            return Err(PhyError::InvalidConfiguration(
                "sync tone mask is empty".into(),
            ));
        }

        let mut fft = FftEngine::new()?;
        let preamble = Preamble::new(&config.sync_tone_mask, &mut fft);

        let broadcast_qpsk = ToneMap::uniform(&config.broadcast_tone_mask, Modulation::Qpsk);
        let broadcast_qpsk_tone_info = ToneInfo::new(broadcast_qpsk.clone(), CodeRate::Rate1_2);
        let custom_tone_info = ToneInfo::new(broadcast_qpsk, STANDARD_RATE);
        let qpsk_tone_mask = config.broadcast_tone_mask.clone();

        info!(
            "PHY service: {} active carriers, {} broadcast tones, estimator {:?}",
            config.tone_mask.count(),
            n_broadcast_tones,
            config.channel_est
        );

        Ok(Self {
            tone_mask: Arc::new(config.tone_mask),
            broadcast_tone_mask: Arc::new(config.broadcast_tone_mask),
            sync_tone_mask: Arc::new(config.sync_tone_mask),
            n_broadcast_tones,
            channel_est_mode: config.channel_est,
            broadcast_qpsk_tone_info,
            custom_tone_info,
            qpsk_tone_mask,
            preamble: Arc::new(preamble),
            turbo: TurboCodec::new(),
            fft,
            channel: ChannelResponse::flat(),
            noise_psd: vec![NOISE_FLOOR; NUMBER_OF_CARRIERS],
            rx_params: None,
            rx_fields: None,
            rx_symbols_freq: Vec::new(),
            rx_soft_bits: Vec::new(),
            stats: Stats::default(),
        })
    }

    /// The immutable preamble reference
    pub fn preamble(&self) -> &Preamble {
        &self.preamble
    }

    pub fn get_inter_frame_space(&self) -> usize {
        MIN_INTERFRAME_SPACE
    }

    fn tone_info_for(&self, mode: ToneMode) -> &ToneInfo {
        match mode {
            ToneMode::Standard => &self.custom_tone_info,
            _ => &self.broadcast_qpsk_tone_info,
        }
    }

    fn rate_for(&self, mode: ToneMode) -> CodeRate {
        self.tone_info_for(mode).rate
    }

    /// Turbo input bits of one physical block: data plus CRC
    fn block_info_bits(pb_size: PbSize) -> usize {
        8 * (pb_size.bytes() + PB_CRC_BYTES)
    }

    /// Payload symbols needed for `n_blocks` encoded blocks
    fn expected_symbols(&self, mode: ToneMode, n_blocks: usize, pb_size: PbSize) -> usize {
        let rate = self.rate_for(mode);
        let total = n_blocks * calc_encoded_block_size(rate, Self::block_info_bits(pb_size));
        if mode.is_robo() {
            let params = calc_robo_parameters(mode, total, self.n_broadcast_tones);
            (total + params.n_pad) / params.bits_in_segment
        } else {
            total.div_ceil(self.tone_info_for(mode).capacity)
        }
    }

    /// Largest block count a single frame can carry in a tone mode
    pub fn max_blocks(&self, mode: ToneMode) -> usize {
        let pb_size = match mode {
            ToneMode::MiniRobo => PbSize::Pb136,
            _ => PbSize::Pb520,
        };
        let fec = calc_encoded_block_size(self.rate_for(mode), Self::block_info_bits(pb_size));
        let frame_bits = if mode.is_robo() {
            let params = calc_robo_parameters(mode, fec, self.n_broadcast_tones);
            MAX_FRAME_SYMBOLS * params.bits_in_segment
        } else {
            MAX_FRAME_SYMBOLS * self.tone_info_for(mode).capacity
        };
        (frame_bits / fec).min(u16::MAX as usize)
    }

    // ------------------------------------------------------------------
    // Transmit path
    // ------------------------------------------------------------------

    /// Encode an MPDU into its complex baseband sample stream
    pub fn create_ppdu(
        &mut self,
        mpdu_fc: &[u8],
        mpdu_payload: Option<&[u8]>,
    ) -> Result<Vec<Complex32>, PhyError> {
        let mut fc: [u8; FRAME_CONTROL_BYTES] = mpdu_fc.try_into().map_err(|_| {
            PhyError::InvalidFrameControl(format!("frame control must be 16 bytes, got {}", mpdu_fc.len()))
        })?;
        let delimiter = DelimiterType::from_u8(fc[0]).ok_or_else(|| {
            PhyError::InvalidFrameControl(format!("delimiter {}", fc[0]))
        })?;

        let generated_sound;
        let (stream, n_blocks, n_symbols, tone_map) = match delimiter {
            DelimiterType::Sof => {
                let tx = self.get_tx_params(&fc)?;
                let payload = mpdu_payload.ok_or_else(|| {
                    PhyError::InvalidFrameControl("SOF frame requires a payload".into())
                })?;
                self.build_payload_symbols(payload, tx)?
            }
            DelimiterType::Sound => {
                let tx = self.get_tx_params(&fc)?;
                let payload = match mpdu_payload {
                    Some(p) => p,
                    None => {
                        generated_sound = self.sound_payload(tx.pb_size, 1);
                        &generated_sound
                    }
                };
                self.build_payload_symbols(payload, tx)?
            }
            DelimiterType::Sack => {
                if mpdu_payload.is_some() {
                    return Err(PhyError::InvalidFrameControl(
                        "SACK frames carry no payload".into(),
                    ));
                }
                (Vec::new(), 0, 0, None)
            }
            other => {
                return Err(PhyError::InvalidFrameControl(format!(
                    "unsupported delimiter type {:?}",
                    other
                )));
            }
        };

        if delimiter == DelimiterType::Sack {
            frame_control::seal(&mut fc);
        } else {
            frame_control::update(&mut fc, n_blocks, n_symbols);
        }

        let fc_carriers = self.encode_frame_control(&fc)?;

        // Assemble the time-domain stream with raised-cosine overlap
        let stride = FFT_SIZE + GUARD_INTERVAL_PAYLOAD;
        let mut out = Vec::with_capacity(
            self.preamble.samples.len()
                + FFT_SIZE
                + GUARD_INTERVAL_FC
                + n_symbols * stride
                + ROLLOFF_INTERVAL,
        );
        self.append_preamble(&mut out);

        let fc_body = self.fft.ifft(&fc_carriers);
        append_symbol(&mut out, &fc_body, GUARD_INTERVAL_FC);

        if let Some(map) = tone_map {
            let capacity = map.capacity();
            for chunk in stream.chunks(capacity) {
                let carriers = map_symbol_carriers(&map, chunk);
                let body = self.fft.ifft(&carriers);
                append_symbol(&mut out, &body, GUARD_INTERVAL_PAYLOAD);
            }
        }

        debug!(
            "PPDU encoded: {:?}, {} blocks, {} symbols, {} samples",
            delimiter,
            n_blocks,
            n_symbols,
            out.len()
        );
        Ok(out.into_iter().map(|s| Complex32::new(s, 0.0)).collect())
    }

    fn get_tx_params(&self, fc: &[u8; FRAME_CONTROL_BYTES]) -> Result<TxParams, PhyError> {
        let tone_mode = ToneMode::from_u8(fc[1])
            .ok_or_else(|| PhyError::InvalidFrameControl(format!("tone mode {}", fc[1])))?;
        let pb_size = PbSize::from_u8(fc[2])
            .ok_or_else(|| PhyError::InvalidFrameControl(format!("PB size code {}", fc[2])))?;
        Ok(TxParams { tone_mode, pb_size })
    }

    /// Scramble, block-encode and interleave a payload, then lay it out
    /// over OFDM symbols. Returns the symbol-aligned bit stream, the
    /// block and symbol counts and the tone map to modulate with.
    #[allow(clippy::type_complexity)]
    fn build_payload_symbols(
        &self,
        payload: &[u8],
        tx: TxParams,
    ) -> Result<(Vec<bool>, usize, usize, Option<ToneMap>), PhyError> {
        let pb_bytes = tx.pb_size.bytes();
        if payload.is_empty() || payload.len() % pb_bytes != 0 {
            return Err(PhyError::PayloadSize {
                expected: pb_bytes,
                actual: payload.len(),
            });
        }
        let n_blocks = payload.len() / pb_bytes;
        if n_blocks > self.max_blocks(tx.tone_mode) {
            return Err(PhyError::PayloadSize {
                expected: pb_bytes * self.max_blocks(tx.tone_mode),
                actual: payload.len(),
            });
        }

        let tone_info = self.tone_info_for(tx.tone_mode);
        let rate = tone_info.rate;

        let mut bits = unpack_bits(payload);
        Scrambler::new().scramble(&mut bits);

        let mut stream = Vec::new();
        for block in bits.chunks(pb_bytes * 8) {
            let mut block_bits = block.to_vec();
            crc24_append(&mut block_bits);
            let encoded = self.turbo.encode(&block_bits, rate)?;
            stream.extend(channel_interleaver(
                &encoded.info,
                &encoded.parity,
                tx.pb_size,
                rate,
            ));
        }

        let n_symbols;
        if tx.tone_mode.is_robo() {
            stream = robo_interleaver(&stream, tx.tone_mode, self.n_broadcast_tones);
            n_symbols = stream.len() / tone_info.capacity;
        } else {
            n_symbols = stream.len().div_ceil(tone_info.capacity);
            stream.resize(n_symbols * tone_info.capacity, false);
        }

        Ok((
            stream,
            n_blocks,
            n_symbols,
            Some(tone_info.tone_map.clone()),
        ))
    }

    /// Turbo-encode frame control and spread it over the broadcast QPSK
    /// carriers with cyclic diversity copies
    fn encode_frame_control(
        &self,
        fc: &[u8; FRAME_CONTROL_BYTES],
    ) -> Result<Vec<Complex32>, PhyError> {
        let bits = unpack_bits(fc);
        let encoded = self.turbo.encode(&bits, CodeRate::Rate1_2)?;
        let interleaved = channel_interleaver(
            &encoded.info,
            &encoded.parity,
            PbSize::Pb16,
            CodeRate::Rate1_2,
        );

        let capacity = self.broadcast_qpsk_tone_info.capacity;
        let spread: Vec<bool> = (0..capacity)
            .map(|j| interleaved[j % interleaved.len()])
            .collect();
        Ok(map_symbol_carriers(
            &self.broadcast_qpsk_tone_info.tone_map,
            &spread,
        ))
    }

    /// Deterministic reference payload of sound frames
    fn sound_payload(&self, pb_size: PbSize, n_blocks: usize) -> Vec<u8> {
        let mut payload = vec![0u8; pb_size.bytes() * n_blocks];
        PnGenerator::new(SOUND_PN_SEED).fill_bytes(&mut payload);
        payload
    }

    /// Prepend the preamble with its edge rolloff and cyclic tail
    fn append_preamble(&self, out: &mut Vec<f32>) {
        for (k, &s) in self.preamble.samples.iter().enumerate() {
            let w = if k < ROLLOFF_INTERVAL {
                raised_cosine(k)
            } else {
                1.0
            };
            out.push(s * w);
        }
        // Continuation of the inverted SYNCP pattern, ramped down
        for k in 0..ROLLOFF_INTERVAL {
            out.push(-self.preamble.syncp[k] * (1.0 - raised_cosine(k)));
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Channel-estimate from the aligned received preamble
    pub fn process_ppdu_preamble(&mut self, samples: &[f32]) {
        channel::estimate_from_preamble(
            samples,
            &self.preamble,
            &self.sync_tone_mask,
            &mut self.channel,
            &mut self.fft,
        );
    }

    /// Decode the frame control symbol; on success the receive
    /// parameters are latched for the payload
    pub fn process_ppdu_frame_control(&mut self, samples: &[f32]) -> bool {
        self.stats.frames_attempted += 1;
        self.rx_params = None;
        self.rx_fields = None;

        let window = &samples[GUARD_INTERVAL_FC..GUARD_INTERVAL_FC + FFT_SIZE];
        let freq = self.fft.fft(window);

        let mut soft = Vec::with_capacity(2 * self.n_broadcast_tones);
        for k in self.broadcast_tone_mask.iter_active() {
            let h = self.channel.carriers[k];
            if h.norm_sqr() < NOISE_FLOOR {
                soft.push(0.0);
                soft.push(0.0);
                continue;
            }
            let gain = self.channel.frame_control_carriers[k];
            let n0 = self.noise_psd[k].max(NOISE_FLOOR) / (gain * gain).max(NOISE_FLOOR);
            demodulate_soft_bits(freq[k] / h, Modulation::Qpsk, n0, &mut soft);
        }

        // Fold the cyclic diversity copies
        let enc_len = calc_encoded_block_size(CodeRate::Rate1_2, FRAME_CONTROL_NBITS);
        let mut acc = vec![0.0f32; enc_len];
        for (j, &llr) in soft.iter().enumerate() {
            acc[j % enc_len] += llr;
        }

        let (info_llr, parity_llr) =
            channel_deinterleaver(&acc, FRAME_CONTROL_NBITS + 6, PbSize::Pb16, CodeRate::Rate1_2);
        let bits = match self.turbo.decode(&info_llr, &parity_llr, CodeRate::Rate1_2) {
            Ok(bits) => bits,
            Err(e) => {
                warn!("frame control turbo decode failed: {}", e);
                return false;
            }
        };

        let bytes = pack_bits(&bits);
        let mut fc = [0u8; FRAME_CONTROL_BYTES];
        fc.copy_from_slice(&bytes);
        let fields = match frame_control::parse(&fc) {
            Ok(fields) => fields,
            Err(e) => {
                debug!("frame control rejected: {}", e);
                return false;
            }
        };

        match fields.delimiter {
            DelimiterType::Sof | DelimiterType::Sound => {
                if fields.n_blocks == 0
                    || fields.n_blocks > self.max_blocks(fields.tone_mode)
                    || fields.n_symbols
                        != self.expected_symbols(fields.tone_mode, fields.n_blocks, fields.pb_size)
                {
                    debug!(
                        "frame control rejected: inconsistent layout ({} blocks, {} symbols)",
                        fields.n_blocks, fields.n_symbols
                    );
                    return false;
                }
                let rate = self.rate_for(fields.tone_mode);
                self.rx_params = Some(RxParams {
                    delimiter: fields.delimiter,
                    n_symbols: fields.n_symbols,
                    n_blocks: fields.n_blocks,
                    pb_size: fields.pb_size,
                    tone_mode: fields.tone_mode,
                    rate,
                    fec_block_size: calc_encoded_block_size(
                        rate,
                        Self::block_info_bits(fields.pb_size),
                    ),
                });
            }
            DelimiterType::Sack => {
                self.rx_params = Some(RxParams {
                    delimiter: DelimiterType::Sack,
                    n_symbols: 0,
                    n_blocks: 0,
                    pb_size: PbSize::Pb16,
                    tone_mode: ToneMode::Standard,
                    rate: CodeRate::Rate1_2,
                    fec_block_size: 0,
                });
            }
            other => {
                warn!("unsupported delimiter type {:?}", other);
                return false;
            }
        }
        self.rx_fields = Some(fields);
        self.stats.frames_decoded += 1;
        true
    }

    /// Delimiter of the frame currently being received
    pub fn get_frame_type(&self) -> Option<DelimiterType> {
        self.rx_params.as_ref().map(|p| p.delimiter)
    }

    /// SACK data of the current frame
    pub fn get_sackd(&self) -> Option<[u8; frame_control::SACKD_BYTES]> {
        self.rx_fields.as_ref().and_then(|f| {
            (f.delimiter == DelimiterType::Sack).then_some(f.sackd)
        })
    }

    /// Payload sample count of the current frame
    pub fn get_ppdu_payload_length(&self) -> usize {
        self.rx_params
            .as_ref()
            .map(|p| p.n_symbols * (FFT_SIZE + GUARD_INTERVAL_PAYLOAD))
            .unwrap_or(0)
    }

    /// Decoded payload byte count of the current frame
    pub fn get_mpdu_payload_size(&self) -> usize {
        self.rx_params
            .as_ref()
            .map(|p| p.n_blocks * p.pb_size.bytes())
            .unwrap_or(0)
    }

    /// Decode the payload sample window latched by frame control
    ///
    /// Block CRC failures are counted in the stats; the payload is still
    /// delivered, classification is the MAC's job.
    pub fn process_ppdu_payload(&mut self, samples: &[f32]) -> Bytes {
        let Some(params) = self.rx_params.clone() else {
            return Bytes::new();
        };
        if params.n_symbols == 0 {
            return Bytes::new();
        }

        let tone_map = self.tone_info_for(params.tone_mode).tone_map.clone();
        let stride = FFT_SIZE + GUARD_INTERVAL_PAYLOAD;

        self.rx_symbols_freq.clear();
        let mut soft = std::mem::take(&mut self.rx_soft_bits);
        soft.clear();

        for s in 0..params.n_symbols {
            let window = &samples[s * stride + GUARD_INTERVAL_PAYLOAD..s * stride + GUARD_INTERVAL_PAYLOAD + FFT_SIZE];
            let freq = self.fft.fft(window);
            for k in 0..NUMBER_OF_CARRIERS {
                let m = tone_map.get(k);
                if m == Modulation::Nulled {
                    continue;
                }
                let h = self.channel.carriers[k];
                if h.norm_sqr() < NOISE_FLOOR {
                    for _ in 0..m.bits() {
                        soft.push(0.0);
                    }
                    continue;
                }
                let n0 = self.noise_psd[k].max(NOISE_FLOOR) / h.norm_sqr();
                demodulate_soft_bits(freq[k] / h, m, n0, &mut soft);
            }
            self.rx_symbols_freq.push(freq);
        }

        let total_enc = params.n_blocks * params.fec_block_size;
        let combined: Vec<f32> = if params.tone_mode.is_robo() {
            robo_deinterleaver(&soft, total_enc, params.tone_mode, self.n_broadcast_tones)
        } else {
            soft[..total_enc].to_vec()
        };
        self.rx_soft_bits = soft;

        let info_bits = Self::block_info_bits(params.pb_size);
        let mut scrambled = Vec::with_capacity(params.n_blocks * params.pb_size.bytes() * 8);
        for b in 0..params.n_blocks {
            let chunk = &combined[b * params.fec_block_size..(b + 1) * params.fec_block_size];
            let (info_llr, parity_llr) =
                channel_deinterleaver(chunk, info_bits + 6, params.pb_size, params.rate);
            self.stats.blocks_decoded += 1;
            match self.turbo.decode(&info_llr, &parity_llr, params.rate) {
                Ok(bits) => {
                    if !crc24_check(&bits) {
                        self.stats.block_errors += 1;
                        debug!("payload block {} failed its CRC", b);
                    }
                    scrambled.extend_from_slice(&bits[..params.pb_size.bytes() * 8]);
                }
                Err(e) => {
                    self.stats.block_errors += 1;
                    warn!("payload block {} decode error: {}", b, e);
                    scrambled.resize(scrambled.len() + params.pb_size.bytes() * 8, false);
                }
            }
        }

        Scrambler::new().scramble(&mut scrambled);
        let payload = pack_bits(&scrambled);

        self.post_process_ppdu(&params, &payload);
        payload
    }

    /// Per-frame estimation hooks that run after payload decode
    fn post_process_ppdu(&mut self, params: &RxParams, payload: &[u8]) {
        if params.delimiter == DelimiterType::Sound {
            let reference = self.sound_payload(params.pb_size, params.n_blocks);
            let errors: u64 = payload
                .iter()
                .zip(reference.iter())
                .map(|(&a, &b)| (a ^ b).count_ones() as u64)
                .sum();
            self.stats.bit_errors += errors;

            if self.channel_est_mode == ChannelEstMode::Sound {
                let tx = TxParams {
                    tone_mode: params.tone_mode,
                    pb_size: params.pb_size,
                };
                if let Ok((stream, _, _, Some(map))) = self.build_payload_symbols(&reference, tx) {
                    let ref_symbols: Vec<Vec<Complex32>> = stream
                        .chunks(map.capacity())
                        .map(|chunk| map_symbol_carriers(&map, chunk))
                        .collect();
                    channel::estimate_from_sound(
                        &self.rx_symbols_freq,
                        &ref_symbols,
                        &self.tone_mask,
                        &mut self.channel,
                    );
                }
            }
        } else if params.delimiter == DelimiterType::Sof
            && self.channel_est_mode == ChannelEstMode::PayloadQpsk
            && params.tone_mode == ToneMode::Standard
        {
            let rx_symbols = std::mem::take(&mut self.rx_symbols_freq);
            channel::estimate_from_payload_qpsk(
                &rx_symbols,
                &self.qpsk_tone_mask,
                &self.tone_mask,
                &mut self.channel,
            );
            self.rx_symbols_freq = rx_symbols;
        }
    }

    // ------------------------------------------------------------------
    // Noise, SNR and tone maps
    // ------------------------------------------------------------------

    /// Estimate the per-carrier noise PSD from inter-frame-space samples
    pub fn process_noise(&mut self, samples: &[f32]) {
        self.noise_psd = channel::estimate_noise_psd(samples, &mut self.fft);
        self.stats.last_snr = self.get_snr();
    }

    /// Override the noise PSD with a flat estimate
    pub fn set_noise_psd(&mut self, value: f32) {
        self.noise_psd = vec![value.max(NOISE_FLOOR); NUMBER_OF_CARRIERS];
    }

    /// Per-carrier SNR over the active tone mask
    pub fn get_snr(&self) -> Vec<f32> {
        channel::snr_vector(&self.channel, &self.noise_psd, &self.tone_mask)
    }

    /// Deterministic tone-map selection for a target symbol error rate
    pub fn calculate_tone_map(&self, target_ser: f32, force_mask: Option<&ToneMask>) -> ToneMap {
        channel::select_tone_map(
            &self.channel,
            &self.noise_psd,
            target_ser,
            force_mask,
            &self.tone_mask,
        )
    }

    /// Install a tone map as the standard-mode modulation plan
    pub fn set_tone_map(&mut self, tone_map: ToneMap) {
        self.qpsk_tone_mask = tone_map.carriers_with(Modulation::Qpsk);
        self.custom_tone_info = ToneInfo::new(tone_map, STANDARD_RATE);
        debug!(
            "tone map installed: capacity {} bits/symbol",
            self.custom_tone_info.capacity
        );
    }
}

/// Raised-cosine ramp weight at rolloff position `k`
fn raised_cosine(k: usize) -> f32 {
    0.5 * (1.0 - (PI * (k as f32 + 0.5) / ROLLOFF_INTERVAL as f32).cos())
}

/// Append one OFDM symbol with its cyclic prefix, overlap-adding the
/// rolloff region onto the ramped tail already in `out`
fn append_symbol(out: &mut Vec<f32>, body: &[f32], guard: usize) {
    let n = body.len();
    debug_assert!(guard > ROLLOFF_INTERVAL);
    let overlap_start = out.len() - ROLLOFF_INTERVAL;
    for k in 0..ROLLOFF_INTERVAL {
        out[overlap_start + k] += body[n - guard + k] * raised_cosine(k);
    }
    out.extend_from_slice(&body[n - guard + ROLLOFF_INTERVAL..]);
    out.extend_from_slice(body);
    // Ramped cyclic continuation for the next overlap
    for k in 0..ROLLOFF_INTERVAL {
        out.push(body[k] * (1.0 - raised_cosine(k)));
    }
}

/// Map one symbol's bit stream onto carriers per the tone map
fn map_symbol_carriers(tone_map: &ToneMap, bits: &[bool]) -> Vec<Complex32> {
    let mut carriers = vec![Complex32::new(0.0, 0.0); NUMBER_OF_CARRIERS];
    let mut pos = 0;
    for (k, carrier) in carriers.iter_mut().enumerate() {
        let m = tone_map.get(k);
        let n_bits = m.bits();
        if n_bits == 0 {
            continue;
        }
        *carrier = map_bits(&bits[pos..pos + n_bits], m);
        pos += n_bits;
    }
    debug_assert_eq!(pos, bits.len());
    carriers
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ieee1901::{FRAME_CONTROL_SIZE, PREAMBLE_SIZE};

    fn service() -> PhyService {
        PhyService::new(PhyConfig::default()).unwrap()
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 37 + 11) as u8).collect()
    }

    fn real(samples: &[Complex32]) -> Vec<f32> {
        samples.iter().map(|s| s.re).collect()
    }

    /// Drive the aligned receive path: preamble, frame control, payload
    fn receive(svc: &mut PhyService, stream: &[f32]) -> Option<Bytes> {
        svc.process_ppdu_preamble(&stream[..PREAMBLE_SIZE]);
        let fc = &stream[PREAMBLE_SIZE..PREAMBLE_SIZE + FRAME_CONTROL_SIZE];
        if !svc.process_ppdu_frame_control(fc) {
            return None;
        }
        let start = PREAMBLE_SIZE + FRAME_CONTROL_SIZE;
        let len = svc.get_ppdu_payload_length();
        Some(svc.process_ppdu_payload(&stream[start..start + len]))
    }

    #[test]
    fn test_ppdu_length() {
        let mut svc = service();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let samples = svc.create_ppdu(&fc, Some(&payload)).unwrap();
        let n_symbols = svc.expected_symbols(ToneMode::StdRobo, 1, PbSize::Pb520);
        assert_eq!(
            samples.len(),
            PREAMBLE_SIZE
                + FRAME_CONTROL_SIZE
                + n_symbols * (FFT_SIZE + GUARD_INTERVAL_PAYLOAD)
                + ROLLOFF_INTERVAL
        );
        // The baseband stream is real-valued
        assert!(samples.iter().all(|s| s.im == 0.0));
    }

    #[test]
    fn test_sof_round_trip_std_robo() {
        let mut svc = service();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let stream = real(&svc.create_ppdu(&fc, Some(&payload)).unwrap());

        let decoded = receive(&mut svc, &stream).expect("frame control must decode");
        assert_eq!(decoded.as_ref(), payload.as_slice());
        assert_eq!(svc.get_frame_type(), Some(DelimiterType::Sof));
        assert_eq!(svc.stats.block_errors, 0);
        assert_eq!(svc.stats.frames_decoded, 1);
    }

    #[test]
    fn test_sof_round_trip_standard_mode_multi_block() {
        let mut svc = service();
        let payload = test_payload(3 * 136);
        let fc = frame_control::sof_frame_control(ToneMode::Standard, PbSize::Pb136, 3);
        let stream = real(&svc.create_ppdu(&fc, Some(&payload)).unwrap());

        let decoded = receive(&mut svc, &stream).expect("frame control must decode");
        assert_eq!(decoded.as_ref(), payload.as_slice());
        assert_eq!(svc.stats.block_errors, 0);
        assert_eq!(svc.stats.blocks_decoded, 3);
    }

    #[test]
    fn test_sack_round_trip() {
        let mut svc = service();
        let sackd = [0xA5u8, 1, 2, 3, 4, 5, 6, 7];
        let fc = frame_control::sack_frame_control(&sackd);
        let stream = real(&svc.create_ppdu(&fc, None).unwrap());

        let decoded = receive(&mut svc, &stream).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(svc.get_frame_type(), Some(DelimiterType::Sack));
        assert_eq!(svc.get_sackd(), Some(sackd));
        assert_eq!(svc.get_ppdu_payload_length(), 0);
    }

    #[test]
    fn test_sound_round_trip_hs_robo() {
        let mut svc = PhyService::new(PhyConfig {
            channel_est: ChannelEstMode::Sound,
            ..PhyConfig::default()
        })
        .unwrap();
        let fc = frame_control::sound_frame_control(ToneMode::HsRobo);
        let stream = real(&svc.create_ppdu(&fc, None).unwrap());

        let decoded = receive(&mut svc, &stream).unwrap();
        assert_eq!(decoded.len(), 520);
        assert_eq!(svc.get_frame_type(), Some(DelimiterType::Sound));
        assert_eq!(svc.stats.bit_errors, 0);
        // Sound estimation populated the response over active carriers
        let snr = svc.get_snr();
        assert_eq!(snr.len(), svc.tone_mask.count());
    }

    #[test]
    fn test_mini_robo_sound_round_trip() {
        let mut svc = service();
        let fc = frame_control::sound_frame_control(ToneMode::MiniRobo);
        let stream = real(&svc.create_ppdu(&fc, None).unwrap());
        let decoded = receive(&mut svc, &stream).unwrap();
        assert_eq!(decoded.len(), 136);
        assert_eq!(svc.stats.bit_errors, 0);
    }

    #[test]
    fn test_corrupted_frame_control_is_rejected() {
        let mut svc = service();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let mut stream = real(&svc.create_ppdu(&fc, Some(&payload)).unwrap());

        // Stomp on the frame control symbol body
        for s in stream
            .iter_mut()
            .skip(PREAMBLE_SIZE + GUARD_INTERVAL_FC)
            .take(FFT_SIZE)
        {
            *s = 0.0;
        }
        svc.process_ppdu_preamble(&stream[..PREAMBLE_SIZE]);
        let fc_win = &stream[PREAMBLE_SIZE..PREAMBLE_SIZE + FRAME_CONTROL_SIZE];
        assert!(!svc.process_ppdu_frame_control(fc_win));
        assert_eq!(svc.stats.frames_decoded, 0);
        assert_eq!(svc.stats.frames_attempted, 1);
    }

    #[test]
    fn test_payload_size_validation() {
        let mut svc = service();
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        assert!(matches!(
            svc.create_ppdu(&fc, Some(&test_payload(500))),
            Err(PhyError::PayloadSize { .. })
        ));
        assert!(svc.create_ppdu(&fc, None).is_err());
    }

    #[test]
    fn test_max_blocks_positive() {
        let svc = service();
        for mode in [
            ToneMode::Standard,
            ToneMode::MiniRobo,
            ToneMode::StdRobo,
            ToneMode::HsRobo,
        ] {
            assert!(svc.max_blocks(mode) > 0, "{:?}", mode);
        }
        // Heavier redundancy means fewer blocks per frame
        assert!(svc.max_blocks(ToneMode::HsRobo) >= svc.max_blocks(ToneMode::StdRobo));
    }

    #[test]
    fn test_tone_map_request_flow() {
        let mut svc = service();
        svc.set_noise_psd(0.01);
        let map = svc.calculate_tone_map(1e-2, None);
        for k in svc.tone_mask.iter_active() {
            assert_eq!(map.get(k), Modulation::Qam64);
        }
        svc.set_tone_map(map);
        assert_eq!(svc.custom_tone_info.rate, STANDARD_RATE);
        assert!(svc.custom_tone_info.capacity > 0);
        // QAM-64 everywhere leaves no QPSK carriers for re-estimation
        assert_eq!(svc.qpsk_tone_mask.count(), 0);
    }

    #[test]
    fn test_custom_tone_map_round_trip() {
        let mut svc = service();
        // A mixed map: QPSK on most carriers, QAM-16 on a band
        let mut map = ToneMap::uniform(&svc.broadcast_tone_mask, Modulation::Qpsk);
        for k in 400..=500 {
            if svc.broadcast_tone_mask.is_active(k) {
                map.set(k, Modulation::Qam16);
            }
        }
        svc.set_tone_map(map);

        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::Standard, PbSize::Pb520, 1);
        let stream = real(&svc.create_ppdu(&fc, Some(&payload)).unwrap());
        let decoded = receive(&mut svc, &stream).unwrap();
        assert_eq!(decoded.as_ref(), payload.as_slice());
        assert_eq!(svc.stats.block_errors, 0);
    }
}
