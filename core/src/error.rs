use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("Received audio is saturated (peak {peak:.3})")]
    Saturation { peak: f64 },

    #[error("No carrier detected")]
    NoCarrier,

    #[error("Carrier frequency error out of range: {ppm:.1} ppm")]
    FrequencyOutOfRange { ppm: f64 },

    #[error("Incorrect prefix: {errors} errors")]
    BadPrefix { errors: usize },

    #[error("Equalizer training failed: {errors} of {total} symbols in error")]
    TrainingFailed { errors: usize, total: usize },

    #[error("Invalid checksum: {received:08x} != {expected:08x}")]
    BadChecksum { received: u32, expected: u32 },

    #[error("Reed-Solomon decode failure: {0}")]
    EccUnrecoverable(&'static str),

    #[error("Stream ended in the middle of a frame")]
    Truncated,

    #[error("Failed to decode frame #{frame}")]
    DecodeFailed {
        frame: usize,
        #[source]
        source: Box<ModemError>,
    },

    #[error("Failed to read from source: {0}")]
    Source(#[source] io::Error),

    #[error("Failed to write to sink: {0}")]
    Sink(#[source] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input size")]
    InvalidInputSize,
}

pub type Result<T> = std::result::Result<T, ModemError>;
