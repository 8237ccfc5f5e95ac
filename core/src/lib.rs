//! Acoustic data modem
//!
//! Sends arbitrary bytes as 16-bit PCM audio and recovers them on the other
//! side of a speaker/microphone link. The signal is a set of QAM-modulated
//! carriers spaced 1 kHz apart, protected by Reed-Solomon FEC and CRC-32
//! framing. The receiver locks onto a carrier prefix, trains an adaptive
//! equalizer and tracks sender/receiver clock drift while demodulating.

pub mod common;
pub mod config;
pub mod detect;
pub mod dsp;
pub mod equalizer;
pub mod error;
pub mod fec;
pub mod framing;
pub mod qam;
pub mod receiver;
pub mod sampling;
pub mod sender;
pub mod stream;

pub use config::{bitrates, Configuration};
pub use error::{ModemError, Result};
pub use receiver::{recv, try_recv, Receiver, ReceiverState, ReceiverStats};
pub use sender::{send, SendStats, Sender};
pub use stream::{AsyncReader, Dumper};

// FEC configuration
pub const RS_DATA_BYTES: usize = 223;
pub const RS_TOTAL_BYTES: usize = 255;
pub const RS_ECC_BYTES: usize = RS_TOTAL_BYTES - RS_DATA_BYTES; // 32

// Frame configuration
pub const FRAME_HEADER_SIZE: usize = 1 + framing::CHECKSUM_SIZE; // length + CRC-32
pub const BLOCK_SIZE: usize = RS_DATA_BYTES - FRAME_HEADER_SIZE; // 218
