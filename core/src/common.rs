//! PCM conversion and block iteration shared by the send and receive paths

use crate::error::{ModemError, Result};
use std::cell::Cell;
use std::io::{ErrorKind, Read};
use std::rc::Rc;

/// Full-scale float maps to this PCM value, leaving headroom below `i16::MAX`
pub const SCALING: f64 = 32000.0;

/// Received samples at or above this magnitude were clipped by the recorder
pub const SATURATION_THRESHOLD: f64 = (i16::MAX as f64) / SCALING;

/// Bytes requested from the PCM source per read
const READ_CHUNK_BYTES: usize = 4096;

/// Convert little-endian 16-bit PCM to floats. A trailing odd byte is ignored.
pub fn to_float(data: &[u8]) -> Vec<f64> {
    data.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f64 / SCALING)
        .collect()
}

/// Convert floats to little-endian 16-bit PCM, saturating at the i16 range.
pub fn to_pcm(samples: &[f64]) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` saturates out-of-range floats
        let value = (sample * SCALING).round() as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

/// Fail with [`ModemError::Saturation`] if any sample was clipped.
pub fn check_saturation(samples: &[f64]) -> Result<()> {
    let peak = samples.iter().fold(0.0f64, |peak, x| peak.max(x.abs()));
    if peak >= SATURATION_THRESHOLD {
        return Err(ModemError::Saturation { peak });
    }
    Ok(())
}

/// Split an iterator into non-overlapping blocks of `size` items.
///
/// With `truncate` set, a short final block is dropped.
pub fn iterate<I: Iterator>(iter: I, size: usize, truncate: bool) -> Blocks<I> {
    Blocks {
        iter,
        size: size.max(1),
        truncate,
    }
}

pub struct Blocks<I> {
    iter: I,
    size: usize,
    truncate: bool,
}

impl<I: Iterator> Iterator for Blocks<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let block: Vec<I::Item> = self.iter.by_ref().take(self.size).collect();
        if block.is_empty() || (self.truncate && block.len() < self.size) {
            return None;
        }
        Some(block)
    }
}

/// Pull up to `size` samples from a fallible sample stream.
///
/// Returns fewer samples when the stream ends; errors are propagated.
pub fn take<I>(samples: &mut I, size: usize) -> Result<Vec<f64>>
where
    I: Iterator<Item = Result<f64>>,
{
    let mut block = Vec::with_capacity(size);
    for sample in samples.take(size) {
        block.push(sample?);
    }
    Ok(block)
}

/// Shared switch controlling the saturation check of a [`PcmSamples`] stream.
///
/// The receiver keeps a handle and turns the check off once the prefix is
/// verified, after the stream itself has been moved into the sampler.
#[derive(Clone, Debug)]
pub struct SaturationCheck(Rc<Cell<bool>>);

impl SaturationCheck {
    pub fn enabled(&self) -> bool {
        self.0.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.set(enabled);
    }
}

/// Float sample stream decoded from a PCM byte source.
pub struct PcmSamples<R> {
    reader: R,
    raw: Vec<u8>,
    pending: Vec<f64>,
    pos: usize,
    odd_byte: Option<u8>,
    finished: bool,
    check: SaturationCheck,
    total: usize,
}

impl<R: Read> PcmSamples<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            raw: vec![0u8; READ_CHUNK_BYTES],
            pending: Vec::new(),
            pos: 0,
            odd_byte: None,
            finished: false,
            check: SaturationCheck(Rc::new(Cell::new(true))),
            total: 0,
        }
    }

    pub fn saturation_check(&self) -> SaturationCheck {
        self.check.clone()
    }

    /// Samples yielded so far
    pub fn total(&self) -> usize {
        self.total
    }

    fn refill(&mut self) -> Result<bool> {
        loop {
            let count = match self.reader.read(&mut self.raw) {
                Ok(count) => count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ModemError::Source(e)),
            };
            if count == 0 {
                return Ok(false);
            }

            let mut bytes = Vec::with_capacity(count + 1);
            bytes.extend(self.odd_byte.take());
            bytes.extend_from_slice(&self.raw[..count]);
            if bytes.len() % 2 == 1 {
                self.odd_byte = bytes.pop();
            }
            if bytes.is_empty() {
                continue;
            }

            self.pending = to_float(&bytes);
            self.pos = 0;
            return Ok(true);
        }
    }
}

impl<R: Read> Iterator for PcmSamples<R> {
    type Item = Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.pos >= self.pending.len() {
            match self.refill() {
                Ok(true) => {}
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }

        let sample = self.pending[self.pos];
        self.pos += 1;
        self.total += 1;

        if self.check.enabled() && sample.abs() >= SATURATION_THRESHOLD {
            self.finished = true;
            return Some(Err(ModemError::Saturation { peak: sample.abs() }));
        }
        Some(Ok(sample))
    }
}
