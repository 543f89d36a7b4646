//! Message Types for MAC-PHY Communication
//!
//! Defines the tagged commands crossing the MAC boundary in both
//! directions. Byte payloads travel as `Bytes` so buffers are shared,
//! not copied, between the queues and the engine.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages from the MAC to the PHY
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MacMessage {
    /// MAC-TXMSDU: encode and transmit an MPDU
    TxMsdu {
        /// Frame control bytes
        mpdu_fc: Bytes,
        /// Optional payload bytes, a whole number of physical blocks
        mpdu_payload: Option<Bytes>,
    },
    /// PHY-CALCTONEMAP.request: compute and apply a tone map
    CalcToneMapRequest,
}

/// Events from the PHY to the MAC
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PhyEvent {
    /// PHY-RXSOF: a start-of-frame MPDU was decoded
    RxSof { payload: Bytes },
    /// PHY-RXSACK: a selective acknowledgement was decoded
    RxSack { sackd: Bytes },
    /// PHY-RXSOUND: a sound MPDU was decoded
    RxSound,
    /// PHY-RXSNR: per-carrier SNR estimate over the active tone mask
    RxSnr { snr: Vec<f32> },
    /// PHY-RXEND: end of frame handling
    RxEnd,
    /// PHY-CALCTONEMAP.response: per-carrier modulation codes
    ToneMapResponse { tone_map: Vec<u8> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_msdu_without_payload() {
        let msg = MacMessage::TxMsdu {
            mpdu_fc: Bytes::from_static(&[0u8; 16]),
            mpdu_payload: None,
        };
        match msg {
            MacMessage::TxMsdu { mpdu_fc, mpdu_payload } => {
                assert_eq!(mpdu_fc.len(), 16);
                assert!(mpdu_payload.is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_equality() {
        assert_eq!(PhyEvent::RxEnd, PhyEvent::RxEnd);
        assert_ne!(
            PhyEvent::RxSound,
            PhyEvent::RxSnr { snr: vec![1.0] }
        );
    }
}
