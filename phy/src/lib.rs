//! IEEE 1901 FFT-OFDM Physical Layer Engine
//!
//! This crate implements the powerline PHY transceiver: scrambling, turbo
//! coding, channel and ROBO interleaving, QAM mapping, OFDM modulation,
//! preamble construction, channel estimation and tone-map selection, plus
//! the receive-side synchronization state machine and the transmit driver.
//!
//! The engine is deterministic and re-entrant: it owns no threads, timers
//! or sockets and is driven by sample buffers and MAC messages.

pub mod channel;
pub mod fft;
pub mod frame_control;
pub mod interleaver;
pub mod modulation;
pub mod preamble;
pub mod rx;
pub mod scrambler;
pub mod service;
pub mod turbo;
pub mod tx;

use thiserror::Error;

/// Errors surfaced by the PHY engine
///
/// Recoverable receiver conditions (sync divergence, frame-control parse
/// failures, unknown delimiters) are not errors; they reset the receiver
/// state machine internally. `PhyError` covers construction failures and
/// misuse of the encode API.
#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Processing error: {0}")]
    ProcessingError(String),

    #[error("Invalid frame control: {0}")]
    InvalidFrameControl(String),

    #[error("Payload size {actual} is not a whole number of {expected}-byte blocks")]
    PayloadSize { expected: usize, actual: usize },
}

pub use rx::PhyReceiver;
pub use service::{PhyConfig, PhyService, Stats};
pub use tx::PhyTransmitter;
