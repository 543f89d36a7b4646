//! Transmit Driver
//!
//! Pulls MAC messages from a bounded queue, encodes MPDUs into sample
//! buffers and forwards them strictly in arrival order. The blocking
//! dequeue is the driver's only suspension point; closing the MAC side
//! of the channel is the teardown signal and wakes the driver, which
//! exits cleanly without emitting a sample.

use crate::service::{PhyService, TONE_MAP_TARGET_SER};
use interfaces::{MacMessage, PhyEvent};
use num_complex::Complex32;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue-driven transmit half of the PHY
pub struct PhyTransmitter {
    service: PhyService,
    mac_rx: mpsc::Receiver<MacMessage>,
    sample_tx: mpsc::Sender<Vec<Complex32>>,
    event_tx: mpsc::Sender<PhyEvent>,
}

impl PhyTransmitter {
    pub fn new(
        service: PhyService,
        mac_rx: mpsc::Receiver<MacMessage>,
        sample_tx: mpsc::Sender<Vec<Complex32>>,
        event_tx: mpsc::Sender<PhyEvent>,
    ) -> Self {
        Self {
            service,
            mac_rx,
            sample_tx,
            event_tx,
        }
    }

    /// Run until the MAC channel closes
    pub async fn run(mut self) {
        while let Some(msg) = self.mac_rx.recv().await {
            match msg {
                MacMessage::TxMsdu {
                    mpdu_fc,
                    mpdu_payload,
                } => {
                    match self
                        .service
                        .create_ppdu(&mpdu_fc, mpdu_payload.as_deref())
                    {
                        Ok(samples) => {
                            debug!("transmitting PPDU, {} samples", samples.len());
                            if self.sample_tx.send(samples).await.is_err() {
                                // Sample consumer gone, nothing left to drive
                                break;
                            }
                        }
                        // Untrusted MAC input: drop and keep serving
                        Err(e) => warn!("dropping malformed MPDU: {}", e),
                    }
                }
                MacMessage::CalcToneMapRequest => {
                    debug!("calculating tone map");
                    let map = self.service.calculate_tone_map(TONE_MAP_TARGET_SER, None);
                    self.service.set_tone_map(map.clone());
                    if self
                        .event_tx
                        .send(PhyEvent::ToneMapResponse {
                            tone_map: map.to_codes(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        info!("transmit driver torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_control;
    use crate::service::PhyConfig;
    use bytes::Bytes;
    use common::types::{PbSize, ToneMode};

    fn spawn_transmitter() -> (
        mpsc::Sender<MacMessage>,
        mpsc::Receiver<Vec<Complex32>>,
        mpsc::Receiver<PhyEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let service = PhyService::new(PhyConfig::default()).unwrap();
        let (mac_tx, mac_rx) = mpsc::channel(8);
        let (sample_tx, sample_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        let tx = PhyTransmitter::new(service, mac_rx, sample_tx, event_tx);
        let handle = tokio::spawn(tx.run());
        (mac_tx, sample_rx, event_rx, handle)
    }

    fn sof_msdu(n_blocks: usize) -> MacMessage {
        let fc = frame_control::sof_frame_control(ToneMode::StdRobo, PbSize::Pb520, n_blocks);
        let payload: Vec<u8> = (0..520 * n_blocks).map(|i| i as u8).collect();
        MacMessage::TxMsdu {
            mpdu_fc: Bytes::copy_from_slice(&fc),
            mpdu_payload: Some(Bytes::from(payload)),
        }
    }

    #[tokio::test]
    async fn test_encodes_in_arrival_order() {
        let (mac_tx, mut sample_rx, _event_rx, handle) = spawn_transmitter();

        mac_tx.send(sof_msdu(1)).await.unwrap();
        mac_tx.send(sof_msdu(2)).await.unwrap();

        let first = sample_rx.recv().await.unwrap();
        let second = sample_rx.recv().await.unwrap();
        // Two blocks need more symbols than one
        assert!(second.len() > first.len());

        drop(mac_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_without_emitting() {
        let (mac_tx, mut sample_rx, _event_rx, handle) = spawn_transmitter();
        drop(mac_tx);
        handle.await.unwrap();
        assert!(sample_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_mpdu_is_dropped() {
        let (mac_tx, mut sample_rx, _event_rx, handle) = spawn_transmitter();

        // Truncated frame control: dropped without killing the driver
        mac_tx
            .send(MacMessage::TxMsdu {
                mpdu_fc: Bytes::from_static(&[1, 2, 3]),
                mpdu_payload: None,
            })
            .await
            .unwrap();
        mac_tx.send(sof_msdu(1)).await.unwrap();

        let samples = sample_rx.recv().await.unwrap();
        assert!(!samples.is_empty());
        drop(mac_tx);
        handle.await.unwrap();
        assert!(sample_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_tone_map_request_answers() {
        let (mac_tx, _sample_rx, mut event_rx, handle) = spawn_transmitter();

        mac_tx.send(MacMessage::CalcToneMapRequest).await.unwrap();
        match event_rx.recv().await.unwrap() {
            PhyEvent::ToneMapResponse { tone_map } => {
                assert_eq!(tone_map.len(), common::ieee1901::NUMBER_OF_CARRIERS);
            }
            other => panic!("expected ToneMapResponse, got {:?}", other),
        }
        drop(mac_tx);
        handle.await.unwrap();
    }
}
