//! WAV endpoints
//!
//! The modem speaks raw s16le mono PCM. WAV files are converted at the edges:
//! read fully into PCM bytes before decoding, written from the PCM produced by
//! the sender.

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, info};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WavError {
    #[error("WAV I/O failed: {0}")]
    Hound(#[from] hound::Error),

    #[error("sample rate {found} Hz does not match the modem rate of {expected} Hz")]
    SampleRate { found: u32, expected: u32 },

    #[error("unsupported WAV format: {bits}-bit {format:?}")]
    Format { bits: u16, format: SampleFormat },
}

/// True when `path` has a `.wav` extension (any case)
pub fn is_wav(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

/// Load a WAV file as mono s16le PCM at `sample_rate`.
///
/// Multi-channel audio is averaged down to one channel.
pub fn read_pcm(path: &Path, sample_rate: u32) -> Result<Vec<u8>, WavError> {
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();
    debug!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );
    if spec.sample_rate != sample_rate {
        return Err(WavError::SampleRate {
            found: spec.sample_rate,
            expected: sample_rate,
        });
    }

    let samples: Vec<f64> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f64))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits @ (24 | 32)) => {
            let shift = bits - 16;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as f64))
                .collect::<Result<_, _>>()?
        }
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| v as f64 * 32768.0))
            .collect::<Result<_, _>>()?,
        (format, bits) => return Err(WavError::Format { bits, format }),
    };

    let channels = spec.channels.max(1) as usize;
    let pcm: Vec<u8> = samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f64>() / channels as f64)
        .flat_map(|v| (v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16).to_le_bytes())
        .collect();
    info!(
        "Loaded {:.3} seconds of audio from {}",
        (pcm.len() / 2) as f64 / sample_rate as f64,
        path.display()
    );
    Ok(pcm)
}

/// Write s16le mono PCM as a 16-bit WAV file.
pub fn write_pcm(path: &Path, pcm: &[u8], sample_rate: u32) -> Result<(), WavError> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for bytes in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([bytes[0], bytes[1]]))?;
    }
    writer.finalize()?;
    debug!("Wrote {} samples to {}", pcm.len() / 2, path.display());
    Ok(())
}
