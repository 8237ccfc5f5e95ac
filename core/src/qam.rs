//! QAM mapping between bit tuples and constellation points
//!
//! Bit `k` of a tuple selects mask `1 << k` of the symbol index, so the tuple
//! `(b0, b1, ..)` maps to `config.symbols[b0 + 2*b1 + ..]`.
//!
//! Decoding snaps the received point onto a regular grid built from the
//! constellation's distinct real and imaginary coordinates and reads the
//! nearest constellation point from a precomputed table. Points outside the
//! grid are clamped to its edge, so decoding never fails.

use crate::error::{ModemError, Result};
use num_complex::Complex64;

/// Coordinates closer than this are treated as the same grid line
const GRID_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct Qam {
    symbols: Vec<Complex64>,
    bits_per_symbol: usize,
    bits: Vec<Vec<bool>>,
    bias: Complex64,
    real_factor: f64,
    imag_factor: f64,
    real_max: usize,
    imag_max: usize,
    /// Nearest symbol index for grid cell `i * (imag_max + 1) + j`
    lookup: Vec<usize>,
}

/// Distinct sorted coordinates and the reciprocal of their spacing
fn grid_axis(values: impl Iterator<Item = f64>) -> (f64, f64, usize) {
    let mut values: Vec<f64> = values.collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values.dedup_by(|a, b| (*a - *b).abs() < GRID_TOLERANCE);

    let min = values[0];
    if values.len() == 1 {
        return (min, 0.0, 0);
    }

    let spacing = values
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold(f64::INFINITY, f64::min);
    let factor = 1.0 / spacing;
    let max = ((values[values.len() - 1] - min) * factor).round() as usize;
    (min, factor, max)
}

impl Qam {
    pub fn new(symbols: &[Complex64]) -> Result<Self> {
        let npoints = symbols.len();
        if npoints < 2 || !npoints.is_power_of_two() {
            return Err(ModemError::InvalidConfig(format!(
                "constellation size {} is not a power of two",
                npoints
            )));
        }
        let bits_per_symbol = npoints.trailing_zeros() as usize;

        let bits = (0..npoints)
            .map(|index| (0..bits_per_symbol).map(|k| index & (1 << k) != 0).collect())
            .collect();

        let (real_min, real_factor, real_max) = grid_axis(symbols.iter().map(|s| s.re));
        let (imag_min, imag_factor, imag_max) = grid_axis(symbols.iter().map(|s| s.im));
        let bias = Complex64::new(real_min, imag_min);

        let mut lookup = Vec::with_capacity((real_max + 1) * (imag_max + 1));
        for i in 0..=real_max {
            for j in 0..=imag_max {
                let re = if real_factor > 0.0 { i as f64 / real_factor } else { 0.0 };
                let im = if imag_factor > 0.0 { j as f64 / imag_factor } else { 0.0 };
                let point = bias + Complex64::new(re, im);
                let nearest = symbols
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| (*a - point).norm().total_cmp(&(*b - point).norm()))
                    .map(|(index, _)| index)
                    .unwrap_or(0);
                lookup.push(nearest);
            }
        }

        Ok(Self {
            symbols: symbols.to_vec(),
            bits_per_symbol,
            bits,
            bias,
            real_factor,
            imag_factor,
            real_max,
            imag_max,
            lookup,
        })
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.bits_per_symbol
    }

    pub fn symbols(&self) -> &[Complex64] {
        &self.symbols
    }

    /// Map one tuple of `bits_per_symbol` bits to its constellation point.
    pub fn encode_symbol(&self, bits: &[bool]) -> Complex64 {
        let index = bits
            .iter()
            .take(self.bits_per_symbol)
            .enumerate()
            .fold(0usize, |acc, (k, &bit)| acc | ((bit as usize) << k));
        self.symbols[index]
    }

    /// Map a bit stream to symbols; a short trailing tuple is dropped.
    pub fn encode<'a, I>(&'a self, bits: I) -> impl Iterator<Item = Complex64> + 'a
    where
        I: IntoIterator<Item = bool>,
        I::IntoIter: 'a,
    {
        crate::common::iterate(bits.into_iter(), self.bits_per_symbol, true)
            .map(move |tuple| self.encode_symbol(&tuple))
    }

    /// Nearest constellation point to `received` and its bit tuple.
    pub fn decode_symbol(&self, received: Complex64) -> (Complex64, &[bool]) {
        let s = received - self.bias;
        let i = (s.re * self.real_factor).round().clamp(0.0, self.real_max as f64) as usize;
        let j = (s.im * self.imag_factor).round().clamp(0.0, self.imag_max as f64) as usize;
        let index = self.lookup[i * (self.imag_max + 1) + j];
        (self.symbols[index], &self.bits[index])
    }

    /// Decode a run of symbols, reporting each `(received, decoded)` pair.
    pub fn decode<F>(&self, symbols: &[Complex64], mut on_decode: F) -> Vec<Vec<bool>>
    where
        F: FnMut(Complex64, Complex64),
    {
        symbols
            .iter()
            .map(|&received| {
                let (decoded, bits) = self.decode_symbol(received);
                on_decode(received, decoded);
                bits.to_vec()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_encode_bit_order() {
        let config = Configuration::for_bitrate(4).unwrap();
        let qam = Qam::new(&config.symbols).unwrap();
        assert_eq!(qam.bits_per_symbol(), 2);

        assert_eq!(qam.encode_symbol(&[false, false]), config.symbols[0]);
        assert_eq!(qam.encode_symbol(&[true, false]), config.symbols[1]);
        assert_eq!(qam.encode_symbol(&[false, true]), config.symbols[2]);
        assert_eq!(qam.encode_symbol(&[true, true]), config.symbols[3]);
    }

    #[test]
    fn test_decode_exact_points() {
        for kbps in [1, 4, 12, 20] {
            let config = Configuration::for_bitrate(kbps).unwrap();
            let qam = Qam::new(&config.symbols).unwrap();
            for (index, &symbol) in config.symbols.iter().enumerate() {
                let (decoded, bits) = qam.decode_symbol(symbol);
                assert_eq!(decoded, symbol);
                let expected: Vec<bool> =
                    (0..qam.bits_per_symbol()).map(|k| index & (1 << k) != 0).collect();
                assert_eq!(bits, expected.as_slice());
            }
        }
    }

    #[test]
    fn test_decode_noisy_points() {
        let config = Configuration::for_bitrate(20).unwrap();
        let qam = Qam::new(&config.symbols).unwrap();
        let offset = Complex64::new(0.05, -0.04);

        let bits: Vec<bool> = (0..64).map(|i| (i * 7) % 3 == 0).collect();
        let symbols: Vec<Complex64> = qam.encode(bits.clone()).map(|s| s + offset).collect();

        let mut reports = 0;
        let decoded = qam.decode(&symbols, |received, decoded| {
            assert!((received - decoded - offset).norm() < 1e-12);
            reports += 1;
        });
        assert_eq!(reports, symbols.len());
        assert_eq!(decoded.concat(), bits);
    }

    #[test]
    fn test_decode_clamps_outside_grid() {
        let config = Configuration::for_bitrate(4).unwrap();
        let qam = Qam::new(&config.symbols).unwrap();

        let far = Complex64::new(10.0, 10.0);
        let (decoded, _) = qam.decode_symbol(far);
        assert!(decoded.re > 0.0 && decoded.im > 0.0);

        let (decoded, _) = qam.decode_symbol(Complex64::new(f64::NAN, -10.0));
        assert!(config.symbols.contains(&decoded));
    }

    #[test]
    fn test_rejects_bad_constellation() {
        let symbols = vec![Complex64::new(1.0, 0.0); 3];
        assert!(Qam::new(&symbols).is_err());
    }
}
