//! Carrier detection
//!
//! Scans the recording symbol by symbol for a sustained tone on the training
//! carrier, then refines the start position to the sample and estimates the
//! received amplitude and the sender/receiver clock mismatch from the prefix.

use crate::common;
use crate::config::Configuration;
use crate::dsp;
use crate::equalizer::CARRIER_DURATION;
use crate::error::{ModemError, Result};
use log::{debug, info};
use num_complex::Complex64;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::iter::{Chain, Map};
use std::vec;

/// Minimal `|coherence|` of a symbol counted as carrier
pub const COHERENCE_THRESHOLD: f64 = 0.9;

/// Consecutive carrier symbols needed for lock
pub const CARRIER_THRESHOLD: usize = CARRIER_DURATION * 9 / 10;

/// Symbols before the lock point searched for the exact start
pub const SEARCH_WINDOW: usize = CARRIER_DURATION / 10;

/// Symbols dropped at each end of the prefix before estimating
const ESTIMATE_SKIP: usize = 5;

/// Buffered samples from the start of the carrier, followed by the rest of the source
pub type Resumed<I> = Chain<Map<vec::IntoIter<f64>, fn(f64) -> Result<f64>>, I>;

/// Outcome of a successful carrier search.
pub struct Detection<I> {
    /// Samples starting at the first carrier sample
    pub samples: Resumed<I>,
    /// Received carrier amplitude (1.0 = sent at full scale)
    pub amplitude: f64,
    /// Relative frequency error, positive when the sender's clock runs fast
    pub freq_err: f64,
    /// Position of the first carrier sample in the detector's input
    pub start: usize,
}

pub struct Detector {
    omega: f64,
    nsym: usize,
    tsym: f64,
    fc: f64,
    maxlen: usize,
    max_offset: usize,
}

impl Detector {
    pub fn new(config: &Configuration) -> Self {
        Self {
            omega: 2.0 * PI * config.fc / config.fs,
            nsym: config.nsym,
            tsym: config.tsym,
            fc: config.fc,
            maxlen: config.baud,
            max_offset: config.samples(config.timeout),
        }
    }

    /// Wait for the carrier, returning the symbols buffered so far and the
    /// index of the first of them.
    fn wait<I>(&self, samples: &mut I) -> Result<(VecDeque<Vec<f64>>, usize)>
    where
        I: Iterator<Item = Result<f64>>,
    {
        let mut counter = 0;
        let mut count = 0;
        let mut bufs = VecDeque::with_capacity(self.maxlen);

        loop {
            let offset = count * self.nsym;
            if offset > self.max_offset {
                debug!("No carrier after {} samples", offset);
                return Err(ModemError::NoCarrier);
            }

            let buf = common::take(samples, self.nsym)?;
            if buf.len() < self.nsym {
                return Err(ModemError::NoCarrier);
            }

            let coeff = dsp::coherence(&buf, self.omega);
            if coeff.norm() > COHERENCE_THRESHOLD {
                counter += 1;
            } else {
                counter = 0;
            }

            if bufs.len() == self.maxlen {
                bufs.pop_front();
            }
            bufs.push_back(buf);
            count += 1;

            if counter == CARRIER_THRESHOLD {
                let first = count - bufs.len();
                return Ok((bufs, first));
            }
        }
    }

    /// Find the carrier in `samples`.
    pub fn run<I>(&self, mut samples: I) -> Result<Detection<I>>
    where
        I: Iterator<Item = Result<f64>>,
    {
        let (bufs, first) = self.wait(&mut samples)?;
        let count = first + bufs.len();
        info!(
            "Carrier detected at ~{:.1} ms @ {:.1} kHz",
            (count - CARRIER_THRESHOLD) as f64 * self.tsym * 1e3,
            self.fc / 1e3
        );
        debug!("Buffered {} ms of audio", (bufs.len() as f64 * self.tsym * 1e3).round());

        let skip = bufs.len().saturating_sub(CARRIER_THRESHOLD + SEARCH_WINDOW);
        let window_first = first + skip;
        let mut buf: Vec<f64> = bufs.into_iter().skip(skip).flatten().collect();

        let trailing = SEARCH_WINDOW + CARRIER_DURATION - CARRIER_THRESHOLD;
        buf.extend(common::take(&mut samples, trailing * self.nsym)?);

        let offset = self.find_start(&buf);
        let start = window_first * self.nsym + offset;
        debug!(
            "Carrier starts at {:.3} ms",
            start as f64 / self.nsym as f64 * self.tsym * 1e3
        );

        let buf = buf.split_off(offset);
        let prefix_length = (CARRIER_DURATION * self.nsym).min(buf.len());
        let (amplitude, freq_err) = self.estimate(&buf[..prefix_length]);

        let resume: fn(f64) -> Result<f64> = Ok;
        Ok(Detection {
            samples: buf.into_iter().map(resume).chain(samples),
            amplitude,
            freq_err,
            start,
        })
    }

    /// Offset in `buf` of the carrier-length window holding the most carrier energy
    fn find_start(&self, buf: &[f64]) -> usize {
        let length = CARRIER_DURATION * self.nsym;
        let mut cumsum = Vec::with_capacity(buf.len() + 1);
        let mut acc = Complex64::new(0.0, 0.0);
        cumsum.push(acc);
        for (k, &x) in buf.iter().enumerate() {
            acc += Complex64::from_polar(x, self.omega * k as f64);
            cumsum.push(acc);
        }

        let last = buf.len().saturating_sub(length);
        (0..=last)
            .map(|k| {
                let end = (k + length).min(buf.len());
                (k, (cumsum[end] - cumsum[k]).norm())
            })
            .fold((0, f64::NEG_INFINITY), |best, (k, energy)| {
                if energy > best.1 {
                    (k, energy)
                } else {
                    best
                }
            })
            .0
    }

    /// Mean carrier amplitude and relative frequency error over a prefix.
    pub fn estimate(&self, buf: &[f64]) -> (f64, f64) {
        let scale = 1.0 / (0.5 * self.nsym as f64);
        let filt: Vec<Complex64> = dsp::exp_iwt(-self.omega, self.nsym)
            .into_iter()
            .map(|h| h * scale)
            .collect();

        let symbols: Vec<Complex64> = buf
            .chunks_exact(self.nsym)
            .map(|frame| filt.iter().zip(frame).map(|(h, &x)| h * x).sum())
            .collect();
        let symbols = if symbols.len() > 2 * ESTIMATE_SKIP {
            &symbols[ESTIMATE_SKIP..symbols.len() - ESTIMATE_SKIP]
        } else {
            &symbols[..]
        };
        if symbols.is_empty() {
            return (0.0, 0.0);
        }

        let amplitude = symbols.iter().map(|s| s.norm()).sum::<f64>() / symbols.len() as f64;
        let angles: Vec<f64> = symbols.iter().map(|s| s.arg()).collect();
        let phase: Vec<f64> = dsp::unwrap(&angles).iter().map(|p| p / (2.0 * PI)).collect();
        let indices: Vec<f64> = (0..phase.len()).map(|i| i as f64).collect();
        let (a, _) = dsp::linear_regression(&indices, &phase);

        (amplitude, a / (self.tsym * self.fc))
    }
}
