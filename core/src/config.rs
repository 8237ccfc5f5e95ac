//! Modem parameters
//!
//! A [`Configuration`] is built once per session and shared by reference
//! between the sender, the receiver and every DSP stage. All derived values
//! (symbol length, constellation, carrier waveforms) are computed up front.

use crate::error::{ModemError, Result};
use num_complex::Complex64;
use std::f64::consts::PI;
use std::fmt;

/// Bits per PCM sample on the wire (signed 16-bit little-endian)
pub const BITS_PER_SAMPLE: usize = 16;

const DEFAULT_FS: f64 = 32e3;
const DEFAULT_TSYM: f64 = 1e-3;

/// Lowest carrier frequency used by the shipped configurations (Hz)
const FIRST_CARRIER: f64 = 2e3;

/// Spacing between adjacent carriers (Hz), equal to the default baud rate
const CARRIER_SPACING: f64 = 1e3;

/// Shipped configurations: (kbps key, number of carriers, constellation size)
const BITRATES: [(u32, usize, usize); 7] = [
    (1, 1, 2),
    (2, 2, 2),
    (4, 2, 4),
    (8, 4, 4),
    (12, 4, 8),
    (16, 8, 4),
    (20, 8, 16),
];

#[derive(Debug, Clone)]
pub struct Configuration {
    /// Sample rate (Hz)
    pub fs: f64,
    /// Sample period (s)
    pub ts: f64,
    /// Samples per symbol
    pub nsym: usize,
    /// Symbol period (s)
    pub tsym: f64,
    /// Symbols per second
    pub baud: usize,
    /// Carrier frequencies (Hz), each an integer multiple of `baud`
    pub frequencies: Vec<f64>,
    /// Index of the carrier used for detection and the training prefix
    pub carrier_index: usize,
    /// Training carrier frequency (Hz)
    pub fc: f64,
    pub npoints: usize,
    /// Constellation points, on or inside the unit circle
    pub symbols: Vec<Complex64>,
    pub bits_per_symbol: usize,
    /// Bits carried by one symbol period across all carriers
    pub bits_per_baud: usize,
    pub modem_bps: f64,
    /// Leading silence written by the sender (s)
    pub silence_start: f64,
    /// Trailing silence written by the sender (s)
    pub silence_stop: f64,
    /// Audio skipped by the receiver before carrier detection (s)
    pub skip_start: f64,
    /// Carrier detection gives up after this much audio (s)
    pub timeout: f64,
    pub bits_per_sample: usize,
    /// Bytes per PCM sample
    pub sample_size: usize,
    carriers: Vec<Vec<Complex64>>,
}

impl Configuration {
    /// Build and validate a configuration.
    ///
    /// Every carrier must be an integer multiple of the baud rate (so each
    /// symbol holds a whole number of cycles) and lie below Nyquist.
    pub fn new(fs: f64, tsym: f64, npoints: usize, frequencies: Vec<f64>) -> Result<Self> {
        if !(fs > 0.0) || !(tsym > 0.0) {
            return Err(ModemError::InvalidConfig(format!(
                "sample rate ({}) and symbol period ({}) must be positive",
                fs, tsym
            )));
        }

        let nsym = (fs * tsym).round();
        if nsym < 1.0 || (nsym - fs * tsym).abs() > 1e-6 {
            return Err(ModemError::InvalidConfig(format!(
                "symbol period {} s is not a whole number of samples at {} Hz",
                tsym, fs
            )));
        }

        let baud = (1.0 / tsym).round();
        if (baud - 1.0 / tsym).abs() > 1e-6 {
            return Err(ModemError::InvalidConfig(format!(
                "symbol period {} s does not give an integer baud rate",
                tsym
            )));
        }

        if npoints < 2 || !npoints.is_power_of_two() {
            return Err(ModemError::InvalidConfig(format!(
                "constellation size {} is not a power of two",
                npoints
            )));
        }

        if frequencies.is_empty() {
            return Err(ModemError::InvalidConfig("no carrier frequencies".to_string()));
        }

        for &freq in &frequencies {
            let cycles = freq / baud;
            if !(freq > 0.0) || (cycles - cycles.round()).abs() > 1e-9 {
                return Err(ModemError::InvalidConfig(format!(
                    "carrier {} Hz is not a multiple of {} baud",
                    freq, baud
                )));
            }
            if freq >= fs / 2.0 {
                return Err(ModemError::InvalidConfig(format!(
                    "carrier {} Hz is above Nyquist ({} Hz)",
                    freq,
                    fs / 2.0
                )));
            }
        }

        Ok(Self::derive(fs, tsym, npoints, frequencies))
    }

    /// Fill in every derived field; parameters are assumed valid.
    fn derive(fs: f64, tsym: f64, npoints: usize, frequencies: Vec<f64>) -> Self {
        let ts = 1.0 / fs;
        let nsym = (fs * tsym).round() as usize;
        let baud = (1.0 / tsym).round() as usize;
        let bits_per_symbol = npoints.trailing_zeros() as usize;
        let bits_per_baud = bits_per_symbol * frequencies.len();
        let carrier_index = 0;

        let carriers = frequencies
            .iter()
            .map(|&freq| {
                (0..nsym)
                    .map(|k| Complex64::from_polar(1.0, 2.0 * PI * freq * ts * k as f64))
                    .collect()
            })
            .collect();

        Self {
            fs,
            ts,
            nsym,
            tsym,
            baud,
            fc: frequencies[carrier_index],
            carrier_index,
            npoints,
            symbols: constellation(npoints),
            bits_per_symbol,
            bits_per_baud,
            modem_bps: (baud * bits_per_baud) as f64,
            frequencies,
            silence_start: 0.5,
            silence_stop: 0.5,
            skip_start: 0.1,
            timeout: 10.0,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_size: BITS_PER_SAMPLE / 8,
            carriers,
        }
    }

    /// Look up a shipped configuration by its kilobit-per-second key.
    pub fn for_bitrate(kbps: u32) -> Result<Self> {
        BITRATES
            .iter()
            .find(|(key, _, _)| *key == kbps)
            .map(|&(_, nfreq, npoints)| Self::shipped(nfreq, npoints))
            .ok_or_else(|| {
                ModemError::InvalidConfig(format!(
                    "unsupported bitrate {} kbps (choose from {:?})",
                    kbps,
                    bitrates()
                ))
            })
    }

    pub fn fastest() -> Self {
        let (_, nfreq, npoints) = BITRATES[BITRATES.len() - 1];
        Self::shipped(nfreq, npoints)
    }

    pub fn slowest() -> Self {
        let (_, nfreq, npoints) = BITRATES[0];
        Self::shipped(nfreq, npoints)
    }

    fn shipped(nfreq: usize, npoints: usize) -> Self {
        let frequencies = (0..nfreq)
            .map(|i| FIRST_CARRIER + i as f64 * CARRIER_SPACING)
            .collect();
        Self::derive(DEFAULT_FS, DEFAULT_TSYM, npoints, frequencies)
    }

    /// Override the sender's leading and trailing silence (seconds).
    pub fn with_silence(mut self, start: f64, stop: f64) -> Self {
        self.silence_start = start.max(0.0);
        self.silence_stop = stop.max(0.0);
        self
    }

    /// Override the receiver's detection timeout (seconds).
    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout.max(0.0);
        self
    }

    pub fn nfreq(&self) -> usize {
        self.frequencies.len()
    }

    /// One symbol period of `exp(2πj·f·k·Ts)` per carrier
    pub fn carriers(&self) -> &[Vec<Complex64>] {
        &self.carriers
    }

    /// Angular frequency of each carrier in radians per sample
    pub fn omegas(&self) -> Vec<f64> {
        self.frequencies
            .iter()
            .map(|&freq| 2.0 * PI * freq / self.fs)
            .collect()
    }

    /// Number of samples in `seconds` of audio
    pub fn samples(&self, seconds: f64) -> usize {
        (seconds * self.fs).round().max(0.0) as usize
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1} kb/s ({} carriers x {}-QAM @ {} baud, Fs = {:.1} kHz)",
            self.modem_bps / 1e3,
            self.nfreq(),
            self.npoints,
            self.baud,
            self.fs / 1e3
        )
    }
}

/// Supported kilobit-per-second keys, slowest first
pub fn bitrates() -> Vec<u32> {
    BITRATES.iter().map(|&(kbps, _, _)| kbps).collect()
}

/// Rectangular constellation of `npoints` points centred on the origin,
/// scaled so the outermost point lies on the unit circle.
fn constellation(npoints: usize) -> Vec<Complex64> {
    let bits = npoints.trailing_zeros() as usize;
    let nx = 1usize << (bits / 2);
    let ny = npoints / nx;

    let centre = Complex64::new((nx - 1) as f64, (ny - 1) as f64) / 2.0;
    let points: Vec<Complex64> = (0..nx)
        .flat_map(|x| (0..ny).map(move |y| Complex64::new(x as f64, y as f64)))
        .map(|p| p - centre)
        .collect();

    let scale = points.iter().map(|p| p.norm()).fold(0.0, f64::max);
    points.into_iter().map(|p| p / scale).collect()
}
