//! TX to RX loopback over a noisy channel
//!
//! This example encodes a SOF MPDU, pushes the samples through an AWGN
//! channel at a configurable SNR and drives the receiver state machine
//! over the result, printing the MAC events it emits.

use common::ieee1901::MIN_INTERFRAME_SPACE;
use common::types::{PbSize, ToneMode};
use interfaces::PhyEvent;
use phy::frame_control;
use phy::service::{PhyConfig, PhyService};
use phy::rx::PhyReceiver;

fn main() {
    tracing_subscriber::fmt::init();

    let snr_db: f32 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(30.0);

    println!("IEEE 1901 PHY loopback");
    println!("======================\n");
    println!("SNR: {} dB", snr_db);

    // Encode a one-block SOF frame
    let mut service = match PhyService::new(PhyConfig::default()) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Failed to create PHY service: {}", e);
            return;
        }
    };
    let payload: Vec<u8> = (0..520).map(|i| (i * 31 + 7) as u8).collect();
    let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, 1);
    let samples = match service.create_ppdu(&fc, Some(&payload)) {
        Ok(samples) => samples,
        Err(e) => {
            eprintln!("Failed to encode PPDU: {}", e);
            return;
        }
    };
    println!("Encoded PPDU: {} samples", samples.len());

    // AWGN channel at the requested SNR
    let signal_power: f32 =
        samples.iter().map(|s| s.re * s.re).sum::<f32>() / samples.len() as f32;
    let noise_power = signal_power / 10f32.powf(snr_db / 10.0);
    let sigma = noise_power.sqrt();
    let mut lcg: u64 = 0x1901_2026;
    let mut gauss = move || {
        // Box-Muller over a simple LCG
        lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1);
        let u1 = ((lcg >> 33) as f32 + 1.0) / 2f32.powi(31);
        lcg = lcg.wrapping_mul(6364136223846793005).wrapping_add(1);
        let u2 = ((lcg >> 33) as f32 + 1.0) / 2f32.powi(31);
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    };

    let mut stream: Vec<f32> = samples.iter().map(|s| s.re + sigma * gauss()).collect();
    stream.extend((0..MIN_INTERFRAME_SPACE + 100).map(|_| sigma * gauss()));

    // Drive the receiver
    let mut receiver = PhyReceiver::new(service);
    let mut events = Vec::new();
    let mut pos = 0;
    while pos < stream.len() {
        let consumed = receiver.work(&stream[pos..], &mut events);
        if consumed == 0 {
            break;
        }
        pos += consumed;
    }

    println!("\nReceiver events:");
    for event in &events {
        match event {
            PhyEvent::RxSof { payload: decoded } => {
                let ok = decoded.as_ref() == payload.as_slice();
                println!("  PHY-RXSOF: {} bytes, payload match: {}", decoded.len(), ok);
            }
            PhyEvent::RxSnr { snr } => {
                let mean = snr.iter().sum::<f32>() / snr.len() as f32;
                println!(
                    "  PHY-RXSNR: {} carriers, mean {:.1} dB",
                    snr.len(),
                    10.0 * mean.log10()
                );
            }
            other => println!("  {:?}", other),
        }
    }

    let stats = &receiver.service().stats;
    println!("\nStats:");
    println!("  frames attempted: {}", stats.frames_attempted);
    println!("  frames decoded:   {}", stats.frames_decoded);
    println!("  blocks decoded:   {}", stats.blocks_decoded);
    println!("  block errors:     {}", stats.block_errors);
}
