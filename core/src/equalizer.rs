//! Training sequences and least-squares channel equalization
//!
//! After the carrier prefix, the sender transmits a known pseudo-random
//! sequence of symbols on every carrier. The receiver fits an FIR filter that
//! maps what it heard back onto what was sent, and installs it in front of
//! the demultiplexer for the rest of the session.

use crate::config::Configuration;
use crate::dsp::{self, Demux};
use crate::error::Result;
use crate::sampling::{Interpolator, Sampler};
use num_complex::Complex64;
use std::iter;
use std::sync::Arc;

/// Carrier bursts at the start of the prefix, in symbols
pub const CARRIER_DURATION: usize = 400;

/// Silent symbols closing the prefix
pub const CARRIER_SILENCE: usize = 50;

/// Silent symbols on either side of the equalizer training sequence
pub const SILENCE_LENGTH: usize = 100;

/// Training sequence length, in symbols
pub const EQUALIZER_LENGTH: usize = 500;

/// Leading training rows held at `1` on every carrier
const CONSTANT_PREFIX: usize = 16;

/// Training sequence seed
const PRBS_REGISTER: u64 = 1;
const PRBS_POLYNOMIAL: u64 = 0x1100b;

const TRAINING_CONSTELLATION: [Complex64; 4] = [
    Complex64::new(1.0, 0.0),
    Complex64::new(0.0, 1.0),
    Complex64::new(-1.0, 0.0),
    Complex64::new(0.0, -1.0),
];

/// On/off pattern of the training carrier opening every transmission
pub fn prefix() -> Vec<f64> {
    let mut prefix = vec![1.0; CARRIER_DURATION];
    prefix.resize(CARRIER_DURATION + CARRIER_SILENCE, 0.0);
    prefix
}

/// Training modulator and demodulator for one configuration.
pub struct Equalizer<'a> {
    config: &'a Configuration,
    omegas: Vec<f64>,
}

impl<'a> Equalizer<'a> {
    pub fn new(config: &'a Configuration) -> Self {
        Self {
            config,
            omegas: config.omegas(),
        }
    }

    /// `length` rows of `nfreq` training symbols drawn from `{1, j, -1, -j}`.
    ///
    /// Always the same for a given configuration.
    pub fn train_symbols(&self, length: usize) -> Vec<Vec<Complex64>> {
        let nfreq = self.config.nfreq();
        let mut r = dsp::prbs(PRBS_REGISTER, PRBS_POLYNOMIAL, 2);

        (0..length)
            .map(|row| {
                (0..nfreq)
                    .map(|_| {
                        let index = r.next().unwrap_or(0) as usize;
                        if row < CONSTANT_PREFIX {
                            TRAINING_CONSTELLATION[0]
                        } else {
                            TRAINING_CONSTELLATION[index]
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Real baseband signal for rows of per-carrier symbols, scaled by
    /// `1/nfreq` so that `|signal| <= 1`.
    pub fn modulator(&self, symbols: &[Vec<Complex64>]) -> Vec<f64> {
        let nsym = self.config.nsym;
        let carriers = self.config.carriers();
        let scale = 1.0 / self.config.nfreq() as f64;

        let mut signal = Vec::with_capacity(symbols.len() * nsym);
        for row in symbols {
            signal.extend((0..nsym).map(|k| {
                let sum: Complex64 = row
                    .iter()
                    .zip(carriers)
                    .map(|(s, carrier)| s * carrier[k])
                    .sum();
                sum.re * scale
            }));
        }
        debug_assert!(signal.iter().all(|x| x.abs() <= 1.0 + 1e-12));
        signal
    }

    /// Demultiplex `size` symbol vectors from `signal`, zero-padded past its end.
    pub fn demodulator(&self, signal: &[f64], size: usize) -> Result<Vec<Vec<Complex64>>> {
        let padded = signal.iter().copied().chain(iter::repeat(0.0)).map(Ok);
        let sampler = Sampler::new(padded, Arc::new(Interpolator::default()), 1.0);
        Demux::new(sampler, &self.omegas, self.config.nsym)
            .take(size)
            .collect()
    }
}

/// FIR taps that map `signal` onto `expected`.
///
/// `expected` leads `signal` by `lookahead` samples, which lets the filter
/// undo a channel delay of up to `lookahead` samples.
pub fn train(signal: &[f64], expected: &[f64], order: usize, lookahead: usize) -> Result<Vec<f64>> {
    dsp::estimate(signal, expected, order, lookahead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_pattern() {
        let prefix = prefix();
        assert_eq!(prefix.len(), 450);
        assert_eq!(prefix.iter().sum::<f64>(), 400.0);
        assert!(prefix[400..].iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_train_symbols_deterministic() {
        let config = Configuration::fastest();
        let equalizer = Equalizer::new(&config);

        let a = equalizer.train_symbols(EQUALIZER_LENGTH);
        let b = equalizer.train_symbols(EQUALIZER_LENGTH);
        assert_eq!(a, b);
        assert_eq!(a.len(), EQUALIZER_LENGTH);
        assert!(a.iter().all(|row| row.len() == config.nfreq()));

        for row in &a[..CONSTANT_PREFIX] {
            assert!(row.iter().all(|&s| s == Complex64::new(1.0, 0.0)));
        }
        for row in &a[CONSTANT_PREFIX..] {
            assert!(row.iter().all(|s| TRAINING_CONSTELLATION.contains(s)));
        }
        let distinct = TRAINING_CONSTELLATION
            .iter()
            .filter(|point| a[CONSTANT_PREFIX..].iter().flatten().any(|s| s == *point))
            .count();
        assert_eq!(distinct, 4);
    }

    #[test]
    fn test_modulator_demodulator() {
        for kbps in [1, 8, 20] {
            let config = Configuration::for_bitrate(kbps).unwrap();
            let equalizer = Equalizer::new(&config);
            let nfreq = config.nfreq() as f64;

            let symbols = equalizer.train_symbols(64);
            let signal = equalizer.modulator(&symbols);
            assert_eq!(signal.len(), 64 * config.nsym);
            assert!(signal.iter().all(|x| x.abs() <= 1.0 + 1e-12));

            let decoded = equalizer.demodulator(&signal, symbols.len() + 2).unwrap();
            assert_eq!(decoded.len(), symbols.len() + 2);
            for (expected, received) in symbols.iter().zip(&decoded) {
                for (s, r) in expected.iter().zip(received) {
                    assert!((s - r * nfreq).norm() < 1e-9);
                }
            }
            // zero padding past the end
            assert!(decoded[symbols.len()].iter().all(|r| r.norm() < 1e-12));
        }
    }

    #[test]
    fn test_train_inverts_channel() {
        let x: Vec<f64> = dsp::prbs(1, 0x1100b, 2)
            .take(1000)
            .map(|v| v as f64 - 1.5)
            .collect();
        let den = [1.0, -0.6, 0.1];
        let num = [0.5];
        let y = dsp::lfilter(&num, &den, &x).unwrap();

        let coeffs = train(&y, &x, 3, 2).unwrap();
        let expected = [0.0, 0.0, 2.0, -1.2, 0.2];
        let err: Vec<f64> = coeffs.iter().zip(&expected).map(|(c, e)| c - e).collect();
        assert_eq!(coeffs.len(), expected.len());
        assert!(dsp::norm(&err) / dsp::norm(&expected) < 1e-12);
    }

    #[test]
    fn test_demodulator_delayed_signal() {
        let config = Configuration::for_bitrate(4).unwrap();
        let equalizer = Equalizer::new(&config);
        let nfreq = config.nfreq() as f64;
        let delay = 3;

        let symbols = equalizer.train_symbols(40);
        let mut signal = vec![0.0; delay * config.nsym];
        signal.extend(equalizer.modulator(&symbols));

        let decoded = equalizer.demodulator(&signal, delay + symbols.len()).unwrap();
        assert!(decoded[..delay].iter().flatten().all(|r| r.norm() < 1e-12));
        for (expected, received) in symbols.iter().zip(&decoded[delay..]) {
            for (s, r) in expected.iter().zip(received) {
                assert!((s - r * nfreq).norm() < 1e-9);
            }
        }

        let silent = equalizer.demodulator(&[], 5).unwrap();
        assert_eq!(silent.len(), 5);
        assert!(silent.iter().flatten().all(|r| r.norm() == 0.0));
    }
}
