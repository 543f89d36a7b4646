//! Receiver State Machine
//!
//! Strictly sequential synchronization and framing over a real-valued
//! sample stream. SEARCH runs a sliding autocorrelation between samples
//! one SYNCP period apart; SYNC refines the frame alignment with a
//! matched filter against the reference preamble; the COPY states hand
//! aligned windows to the PHY service and publish the MAC events in
//! sample order. Recoverable failures reset the machine; it never stops
//! consuming samples.

use crate::service::{PhyService, TONE_MAP_TARGET_SER};
use common::ieee1901::{
    FRAME_CONTROL_SIZE, PREAMBLE_SIZE, SYNCP_SIZE, SYNC_LENGTH, SYNC_MIN_ENERGY,
    SYNC_MIN_PLATEAU, SYNC_THRESHOLD,
};
use common::types::DelimiterType;
use bytes::Bytes;
use interfaces::{MacMessage, PhyEvent};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Reset,
    Search,
    Sync,
    CopyPreamble,
    CopyFrameControl,
    CopyPayload,
    SenseSpace,
    ConsumeSpace,
    Idle,
    Halt,
}

/// Sample-driven receiver front half of the PHY
pub struct PhyReceiver {
    service: PhyService,
    state: ReceiverState,

    // SEARCH autocorrelation
    search_corr: f64,
    energy: f64,
    plateau: usize,

    // Cyclic preamble capture
    preamble_buf: Vec<f32>,
    preamble_offset: usize,

    // SYNC alignment
    sync_filter: Vec<f32>,
    sync_offset: usize,
    frame_start: usize,

    frame_control: Vec<f32>,
    frame_control_offset: usize,

    payload: Vec<f32>,
    payload_size: usize,
    payload_offset: usize,

    noise: Vec<f32>,
    inter_frame_space_offset: usize,
}

impl PhyReceiver {
    pub fn new(service: PhyService) -> Self {
        // Matched filter: the first phase-inverted SYNCP period of the
        // reference preamble
        let sync_filter = service.preamble().sync_window().to_vec();
        Self {
            service,
            state: ReceiverState::Reset,
            search_corr: 0.0,
            energy: 0.0,
            plateau: 0,
            preamble_buf: vec![0.0; PREAMBLE_SIZE],
            preamble_offset: 0,
            sync_filter,
            sync_offset: 0,
            frame_start: 0,
            frame_control: vec![0.0; FRAME_CONTROL_SIZE],
            frame_control_offset: 0,
            payload: Vec::new(),
            payload_size: 0,
            payload_offset: 0,
            noise: Vec::new(),
            inter_frame_space_offset: 0,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn service(&self) -> &PhyService {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut PhyService {
        &mut self.service
    }

    /// Stop consuming samples entirely
    pub fn halt(&mut self) {
        self.state = ReceiverState::Halt;
    }

    /// Pass samples through without processing
    pub fn idle(&mut self) {
        self.state = ReceiverState::Idle;
    }

    /// Re-enable reception after idle or halt
    pub fn enable(&mut self) {
        self.state = ReceiverState::Reset;
    }

    /// Minimum input samples the current state needs to make progress
    pub fn required_input(&self) -> usize {
        match self.state {
            ReceiverState::Reset => 2 * SYNCP_SIZE,
            ReceiverState::Search => 2 * SYNCP_SIZE + 1,
            ReceiverState::Sync => SYNC_LENGTH + SYNCP_SIZE - 1,
            ReceiverState::Halt => 0,
            _ => 1,
        }
    }

    /// Handle a MAC command; malformed or unexpected input is ignored
    pub fn handle_mac(&mut self, msg: &MacMessage, events: &mut Vec<PhyEvent>) {
        match msg {
            MacMessage::CalcToneMapRequest => {
                debug!("calculating tone map");
                let map = self.service.calculate_tone_map(TONE_MAP_TARGET_SER, None);
                self.service.set_tone_map(map.clone());
                events.push(PhyEvent::ToneMapResponse {
                    tone_map: map.to_codes(),
                });
            }
            _ => {}
        }
    }

    #[inline]
    fn push_preamble(&mut self, sample: f32) {
        self.preamble_buf[self.preamble_offset] = sample;
        self.preamble_offset = (self.preamble_offset + 1) % PREAMBLE_SIZE;
    }

    /// Consume samples, emitting MAC events in sample order; returns the
    /// number of input samples consumed
    pub fn work(&mut self, input: &[f32], events: &mut Vec<PhyEvent>) -> usize {
        let n = input.len();
        let mut i = 0usize;

        loop {
            match self.state {
                ReceiverState::Reset => {
                    if n - i < 2 * SYNCP_SIZE {
                        break;
                    }
                    debug!("state = RESET");
                    self.plateau = 0;
                    self.sync_offset = 0;
                    self.preamble_offset = 0;
                    self.frame_control_offset = 0;
                    self.payload_size = 0;
                    self.payload_offset = 0;
                    self.inter_frame_space_offset = 0;
                    self.search_corr = 0.0;
                    self.energy = 0.0;
                    // Seed the running sums over the first SYNCP period
                    for j in 0..SYNCP_SIZE {
                        self.search_corr +=
                            (input[i + j] * input[i + j + SYNCP_SIZE]) as f64;
                        self.energy += (input[i + j] * input[i + j]) as f64;
                    }
                    for j in 0..2 * SYNCP_SIZE {
                        self.push_preamble(input[i + j]);
                    }
                    self.state = ReceiverState::Search;
                }

                ReceiverState::Search => {
                    let mut found = false;
                    while i + 2 * SYNCP_SIZE < n {
                        self.search_corr += (input[i + SYNCP_SIZE] * input[i + 2 * SYNCP_SIZE])
                            as f64
                            - (input[i] * input[i + SYNCP_SIZE]) as f64;
                        self.energy += (input[i + SYNCP_SIZE] * input[i + SYNCP_SIZE]) as f64
                            - (input[i] * input[i]) as f64;
                        if self.energy > SYNC_MIN_ENERGY as f64
                            && self.search_corr / self.energy > SYNC_THRESHOLD as f64
                        {
                            if self.plateau < SYNC_MIN_PLATEAU {
                                self.plateau += 1;
                            } else {
                                debug!("state = SEARCH, found frame");
                                i += 2 * SYNCP_SIZE;
                                self.state = ReceiverState::Sync;
                                found = true;
                                break;
                            }
                        } else {
                            self.plateau = 0;
                        }
                        self.push_preamble(input[i + 2 * SYNCP_SIZE]);
                        i += 1;
                    }
                    if !found {
                        break;
                    }
                }

                ReceiverState::Sync => {
                    if n - i < SYNC_LENGTH + SYNCP_SIZE - 1 {
                        break;
                    }
                    // Matched filter over the alignment window
                    let mut correlation = [0.0f32; SYNC_LENGTH];
                    for (j, c) in correlation.iter_mut().enumerate() {
                        let mut acc = 0.0f32;
                        for (k, &tap) in self.sync_filter.iter().enumerate() {
                            acc += tap * input[i + j + k];
                        }
                        *c = acc;
                    }

                    // Two matched peaks one SYNCP apart mark the inverted
                    // tail; ties resolve to the smaller index
                    let mut max_index = 0usize;
                    let mut max_value = correlation[0] * correlation[SYNCP_SIZE];
                    for j in 1..SYNC_LENGTH - SYNCP_SIZE {
                        let value = correlation[j] * correlation[j + SYNCP_SIZE];
                        if value > max_value {
                            max_index = j;
                            max_value = value;
                        }
                    }
                    for j in 0..SYNC_LENGTH {
                        self.push_preamble(input[i + j]);
                    }
                    i += SYNC_LENGTH;

                    let frame_start =
                        5 * SYNCP_SIZE as isize / 2 + max_index as isize - SYNC_LENGTH as isize;
                    debug!(
                        "state = SYNC, max_index = {}, frame_start = {}",
                        max_index, frame_start
                    );
                    if frame_start < 0 {
                        self.state = ReceiverState::Reset;
                    } else {
                        self.frame_start = frame_start as usize;
                        self.sync_offset = 0;
                        self.state = ReceiverState::CopyPreamble;
                    }
                }

                ReceiverState::CopyPreamble => {
                    while i < n && self.sync_offset < self.frame_start {
                        self.push_preamble(input[i]);
                        self.sync_offset += 1;
                        i += 1;
                    }
                    if self.sync_offset < self.frame_start {
                        break;
                    }
                    // Rotate the ring into a contiguous aligned snapshot
                    let mut aligned = Vec::with_capacity(PREAMBLE_SIZE);
                    aligned.extend_from_slice(&self.preamble_buf[self.preamble_offset..]);
                    aligned.extend_from_slice(&self.preamble_buf[..self.preamble_offset]);
                    self.service.process_ppdu_preamble(&aligned);
                    debug!("state = COPY_PREAMBLE, preamble handed to estimator");
                    self.state = ReceiverState::CopyFrameControl;
                }

                ReceiverState::CopyFrameControl => {
                    while self.frame_control_offset < FRAME_CONTROL_SIZE && i < n {
                        self.frame_control[self.frame_control_offset] = input[i];
                        self.frame_control_offset += 1;
                        i += 1;
                    }
                    if self.frame_control_offset < FRAME_CONTROL_SIZE {
                        break;
                    }
                    if self.service.process_ppdu_frame_control(&self.frame_control) {
                        self.payload_size = self.service.get_ppdu_payload_length();
                        self.payload.clear();
                        self.payload.resize(self.payload_size, 0.0);
                        self.payload_offset = 0;
                        debug!("frame control ok, payload size {}", self.payload_size);
                        self.state = ReceiverState::CopyPayload;
                    } else {
                        warn!("cannot parse frame control");
                        self.state = ReceiverState::Reset;
                    }
                }

                ReceiverState::CopyPayload => {
                    let k = (self.payload_size - self.payload_offset).min(n - i);
                    self.payload[self.payload_offset..self.payload_offset + k]
                        .copy_from_slice(&input[i..i + k]);
                    self.payload_offset += k;
                    i += k;
                    if self.payload_offset < self.payload_size {
                        break;
                    }
                    let payload = self.service.process_ppdu_payload(&self.payload);
                    match self.service.get_frame_type() {
                        Some(DelimiterType::Sof) => {
                            events.push(PhyEvent::RxSof { payload });
                            self.state = ReceiverState::SenseSpace;
                        }
                        Some(DelimiterType::Sack) => {
                            let sackd = self.service.get_sackd().unwrap_or_default();
                            events.push(PhyEvent::RxSack {
                                sackd: Bytes::copy_from_slice(&sackd),
                            });
                            self.state = ReceiverState::ConsumeSpace;
                        }
                        Some(DelimiterType::Sound) => {
                            events.push(PhyEvent::RxSound);
                            self.state = ReceiverState::SenseSpace;
                        }
                        other => {
                            warn!("unsupported frame type {:?}", other);
                            self.state = ReceiverState::Reset;
                        }
                    }
                }

                ReceiverState::SenseSpace => {
                    let space = self.service.get_inter_frame_space();
                    if self.inter_frame_space_offset == 0 {
                        self.noise.clear();
                        self.noise.resize(space, 0.0);
                    }
                    let k = (space - self.inter_frame_space_offset).min(n - i);
                    self.noise[self.inter_frame_space_offset..self.inter_frame_space_offset + k]
                        .copy_from_slice(&input[i..i + k]);
                    self.inter_frame_space_offset += k;
                    i += k;
                    if self.inter_frame_space_offset < space {
                        break;
                    }
                    self.service.process_noise(&self.noise);
                    events.push(PhyEvent::RxSnr {
                        snr: self.service.get_snr(),
                    });
                    let noise_var: f64 = self
                        .noise
                        .iter()
                        .map(|&x| (x * x) as f64)
                        .sum::<f64>()
                        / space as f64;
                    self.service.set_noise_psd(2.0 * noise_var as f32);
                    debug!(
                        "state = SENSE_SPACE, estimated noise psd = {}",
                        2.0 * noise_var
                    );
                    events.push(PhyEvent::RxEnd);
                    self.state = ReceiverState::Reset;
                }

                ReceiverState::ConsumeSpace => {
                    let space = self.service.get_inter_frame_space();
                    let k = (space - self.inter_frame_space_offset).min(n - i);
                    self.inter_frame_space_offset += k;
                    i += k;
                    if self.inter_frame_space_offset < space {
                        break;
                    }
                    events.push(PhyEvent::RxEnd);
                    self.state = ReceiverState::Reset;
                }

                ReceiverState::Idle => {
                    i = n;
                    break;
                }

                ReceiverState::Halt => {
                    break;
                }
            }
        }

        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_control;
    use crate::service::PhyConfig;
    use common::ieee1901::MIN_INTERFRAME_SPACE;
    use common::types::{PbSize, ToneMode};
    use num_complex::Complex32;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn receiver() -> PhyReceiver {
        PhyReceiver::new(PhyService::new(PhyConfig::default()).unwrap())
    }

    fn real(samples: &[Complex32]) -> Vec<f32> {
        samples.iter().map(|s| s.re).collect()
    }

    fn test_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 73 + 29) as u8).collect()
    }

    /// Feed the whole stream and drain all events
    fn run(rx: &mut PhyReceiver, stream: &[f32]) -> Vec<PhyEvent> {
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < stream.len() {
            let consumed = rx.work(&stream[pos..], &mut events);
            if consumed == 0 {
                break;
            }
            pos += consumed;
        }
        events
    }

    #[test]
    fn test_sof_frame_end_to_end() {
        let mut rx = receiver();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let mut stream = real(&rx.service_mut().create_ppdu(&fc, Some(&payload)).unwrap());
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE + 100));

        let events = run(&mut rx, &stream);
        assert_eq!(events.len(), 3);
        match &events[0] {
            PhyEvent::RxSof { payload: decoded } => {
                assert_eq!(decoded.as_ref(), payload.as_slice());
            }
            other => panic!("expected RxSof, got {:?}", other),
        }
        assert!(matches!(events[1], PhyEvent::RxSnr { .. }));
        assert_eq!(events[2], PhyEvent::RxEnd);
        assert!(matches!(
            rx.state(),
            ReceiverState::Reset | ReceiverState::Search
        ));
        assert_eq!(rx.service().stats.block_errors, 0);
    }

    #[test]
    fn test_sack_frame_consumes_space() {
        let mut rx = receiver();
        let sackd = [9u8, 8, 7, 6, 5, 4, 3, 2];
        let fc = frame_control::sack_frame_control(&sackd);
        let mut stream = real(&rx.service_mut().create_ppdu(&fc, None).unwrap());
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE + 2 * SYNCP_SIZE));

        let events = run(&mut rx, &stream);
        assert_eq!(events.len(), 2);
        match &events[0] {
            PhyEvent::RxSack { sackd: decoded } => assert_eq!(decoded.as_ref(), sackd.as_slice()),
            other => panic!("expected RxSack, got {:?}", other),
        }
        assert_eq!(events[1], PhyEvent::RxEnd);
    }

    #[test]
    fn test_sound_frame_reports_snr() {
        let mut rx = receiver();
        let fc = frame_control::sound_frame_control(ToneMode::HsRobo);
        let mut stream = real(&rx.service_mut().create_ppdu(&fc, None).unwrap());
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE + 100));

        let events = run(&mut rx, &stream);
        assert_eq!(events[0], PhyEvent::RxSound);
        match &events[1] {
            PhyEvent::RxSnr { snr } => {
                assert_eq!(snr.len(), rx.service().get_snr().len());
            }
            other => panic!("expected RxSnr, got {:?}", other),
        }
        assert_eq!(events[2], PhyEvent::RxEnd);
        assert_eq!(rx.service().stats.bit_errors, 0);
    }

    #[test]
    fn test_noise_prefix_does_not_false_start() {
        let mut rx = receiver();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let ppdu = real(&rx.service_mut().create_ppdu(&fc, Some(&payload)).unwrap());

        let mut rng = StdRng::seed_from_u64(0x1901);
        let noise_len = 6000;
        let mut stream: Vec<f32> = (0..noise_len)
            .map(|_| rng.gen_range(-0.01f32..0.01))
            .collect();
        stream.extend_from_slice(&ppdu);
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE + 100));

        // Feed the noise region alone: the plateau must never trigger
        let mut events = Vec::new();
        let mut pos = 0;
        while pos < noise_len {
            let consumed = rx.work(&stream[pos..noise_len], &mut events);
            if consumed == 0 {
                break;
            }
            pos += consumed;
        }
        assert!(matches!(
            rx.state(),
            ReceiverState::Search | ReceiverState::Reset
        ));
        assert!(events.is_empty());

        // The frame following the noise decodes cleanly
        while pos < stream.len() {
            let consumed = rx.work(&stream[pos..], &mut events);
            if consumed == 0 {
                break;
            }
            pos += consumed;
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, PhyEvent::RxSof { payload: p } if p.as_ref() == payload.as_slice())));
    }

    #[test]
    fn test_corrupted_frame_control_resets() {
        let mut rx = receiver();
        let payload = test_payload(520);
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let mut stream = real(&rx.service_mut().create_ppdu(&fc, Some(&payload)).unwrap());
        // Corrupt the frame control symbol beyond repair
        for s in stream
            .iter_mut()
            .skip(PREAMBLE_SIZE + 2000)
            .take(2000)
        {
            *s = -*s;
        }
        stream.extend(std::iter::repeat(0.0).take(2 * SYNCP_SIZE));

        let events = run(&mut rx, &stream);
        assert!(!events.iter().any(|e| matches!(e, PhyEvent::RxSof { .. })));
        assert_eq!(rx.service().stats.frames_decoded, 0);
    }

    #[test]
    fn test_idle_consumes_without_events() {
        let mut rx = receiver();
        rx.idle();
        let mut events = Vec::new();
        let consumed = rx.work(&vec![0.5f32; 5000], &mut events);
        assert_eq!(consumed, 5000);
        assert!(events.is_empty());
        rx.enable();
        assert_eq!(rx.state(), ReceiverState::Reset);
    }

    #[test]
    fn test_halt_consumes_nothing() {
        let mut rx = receiver();
        rx.halt();
        let mut events = Vec::new();
        assert_eq!(rx.work(&vec![0.5f32; 100], &mut events), 0);
        assert_eq!(rx.required_input(), 0);
    }

    #[test]
    fn test_required_input_tracks_state() {
        let rx = receiver();
        assert_eq!(rx.required_input(), 2 * SYNCP_SIZE);
    }

    #[test]
    fn test_calc_tone_map_request() {
        let mut rx = receiver();
        rx.service_mut().set_noise_psd(0.01);
        let mut events = Vec::new();
        rx.handle_mac(&MacMessage::CalcToneMapRequest, &mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            PhyEvent::ToneMapResponse { tone_map } => {
                assert_eq!(tone_map.len(), common::ieee1901::NUMBER_OF_CARRIERS);
                assert!(tone_map.iter().any(|&m| m != 0));
            }
            other => panic!("expected ToneMapResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut rx = receiver();
        let payload_a = test_payload(520);
        let payload_b = test_payload(2 * 520);
        let fc1 = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
        let fc2 = frame_control::sof_frame_control(ToneMode::HsRobo, PbSize::Pb520, 2);

        let mut stream = real(&rx.service_mut().create_ppdu(&fc1, Some(&payload_a)).unwrap());
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE));
        stream.extend(real(
            &rx.service_mut().create_ppdu(&fc2, Some(&payload_b)).unwrap(),
        ));
        stream.extend(std::iter::repeat(0.0).take(MIN_INTERFRAME_SPACE + 100));

        let events = run(&mut rx, &stream);
        let sofs: Vec<&PhyEvent> = events
            .iter()
            .filter(|e| matches!(e, PhyEvent::RxSof { .. }))
            .collect();
        assert_eq!(sofs.len(), 2);
        match (sofs[0], sofs[1]) {
            (PhyEvent::RxSof { payload: a }, PhyEvent::RxSof { payload: b }) => {
                assert_eq!(a.as_ref(), payload_a.as_slice());
                assert_eq!(b.as_ref(), payload_b.as_slice());
            }
            _ => unreachable!(),
        }
        assert_eq!(events.iter().filter(|e| **e == PhyEvent::RxEnd).count(), 2);
    }
}
