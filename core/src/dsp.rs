//! DSP building blocks: filters, tone correlation, least-squares FIR
//! estimation and the multi-carrier demultiplexer.

use crate::error::{ModemError, Result};
use crate::sampling::Take;
use num_complex::Complex64;
use std::collections::VecDeque;
use std::f64::consts::PI;

/// Direct-form FIR filter. Tap history persists across calls.
#[derive(Debug, Clone)]
pub struct Fir {
    h: Vec<f64>,
    history: VecDeque<f64>,
}

impl Fir {
    pub fn new(h: Vec<f64>) -> Self {
        let history = VecDeque::from(vec![0.0; h.len()]);
        Self { h, history }
    }

    pub fn process_sample(&mut self, x: f64) -> f64 {
        if self.h.is_empty() {
            return 0.0;
        }
        self.history.pop_back();
        self.history.push_front(x);
        self.h.iter().zip(&self.history).map(|(h, x)| h * x).sum()
    }

    pub fn process(&mut self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&sample| self.process_sample(sample)).collect()
    }

    pub fn process_in_place(&mut self, x: &mut [f64]) {
        for sample in x.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }
}

/// Direct-form IIR filter `a[0]·y[n] = Σ b[i]·x[n-i] − Σ a[i]·y[n-i]`.
#[derive(Debug, Clone)]
pub struct Iir {
    b: Vec<f64>,
    a: Vec<f64>,
    x_history: VecDeque<f64>,
    y_history: VecDeque<f64>,
}

impl Iir {
    pub fn new(b: &[f64], a: &[f64]) -> Result<Self> {
        let a0 = a.first().copied().unwrap_or(0.0);
        if a0 == 0.0 || b.is_empty() {
            return Err(ModemError::InvalidInputSize);
        }
        Ok(Self {
            b: b.iter().map(|v| v / a0).collect(),
            a: a.iter().map(|v| v / a0).collect(),
            x_history: VecDeque::from(vec![0.0; b.len()]),
            y_history: VecDeque::from(vec![0.0; a.len().saturating_sub(1)]),
        })
    }

    pub fn process_sample(&mut self, x: f64) -> f64 {
        self.x_history.pop_back();
        self.x_history.push_front(x);

        let forward: f64 = self.b.iter().zip(&self.x_history).map(|(b, x)| b * x).sum();
        let feedback: f64 = self.a[1..].iter().zip(&self.y_history).map(|(a, y)| a * y).sum();
        let y = forward - feedback;

        if !self.y_history.is_empty() {
            self.y_history.pop_back();
            self.y_history.push_front(y);
        }
        y
    }

    pub fn process(&mut self, x: &[f64]) -> Vec<f64> {
        x.iter().map(|&sample| self.process_sample(sample)).collect()
    }
}

/// Filter `x` through `b(z)/a(z)` starting from rest.
pub fn lfilter(b: &[f64], a: &[f64], x: &[f64]) -> Result<Vec<f64>> {
    Ok(Iir::new(b, a)?.process(x))
}

/// `exp(j·omega·k)` for `k` in `0..n`
pub fn exp_iwt(omega: f64, n: usize) -> Vec<Complex64> {
    (0..n)
        .map(|k| Complex64::from_polar(1.0, omega * k as f64))
        .collect()
}

pub fn norm(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>().sqrt()
}

pub fn rms(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}

/// Normalized correlation of `x` with a tone at `omega` rad/sample.
///
/// The magnitude is 1 for a pure tone at `omega` (whole cycles), and 0 for
/// silence or orthogonal tones.
pub fn coherence(x: &[f64], omega: f64) -> Complex64 {
    let norm_x = norm(x);
    if norm_x == 0.0 {
        return Complex64::new(0.0, 0.0);
    }
    let scale = 1.0 / (0.5 * x.len() as f64).sqrt();
    let dot: Complex64 = exp_iwt(-omega, x.len())
        .iter()
        .zip(x)
        .map(|(h, &v)| h * v)
        .sum();
    dot * scale / norm_x
}

/// Least-squares line fit `y ≈ a·x + b`, returns `(a, b)`.
pub fn linear_regression(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len().min(y.len());
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var = 0.0;
    for (xi, yi) in x[..n].iter().zip(&y[..n]) {
        cov += (xi - mean_x) * (yi - mean_y);
        var += (xi - mean_x) * (xi - mean_x);
    }
    let a = if var > 0.0 { cov / var } else { 0.0 };
    (a, mean_y - a * mean_x)
}

/// Remove 2π jumps from a phase sequence.
pub fn unwrap(phases: &[f64]) -> Vec<f64> {
    let mut result = Vec::with_capacity(phases.len());
    let mut correction = 0.0;
    let mut previous: Option<f64> = None;
    for &phase in phases {
        if let Some(prev) = previous {
            let delta = phase - prev;
            if delta > PI {
                correction -= 2.0 * PI * ((delta + PI) / (2.0 * PI)).floor();
            } else if delta < -PI {
                correction += 2.0 * PI * ((-delta + PI) / (2.0 * PI)).floor();
            }
        }
        previous = Some(phase);
        result.push(phase + correction);
    }
    result
}

/// Fibonacci-style pseudo-random bit sequence generator.
///
/// Yields the low `bits` bits of the shift register at each step.
#[derive(Debug, Clone)]
pub struct Prbs {
    reg: u64,
    poly: u64,
    mask: u64,
    size: u32,
}

pub fn prbs(reg: u64, poly: u64, bits: u32) -> Prbs {
    let mut size = 0;
    while (poly >> size) > 1 {
        size += 1;
    }
    Prbs {
        reg,
        poly,
        mask: (1 << bits) - 1,
        size,
    }
}

impl Iterator for Prbs {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let value = self.reg & self.mask;
        self.reg <<= 1;
        if self.reg >> self.size != 0 {
            self.reg ^= self.poly;
        }
        Some(value)
    }
}

/// Estimate FIR taps `h` (length `order + lookahead`) such that
/// `y[k] ≈ Σ h[i]·x[k + lookahead − i]`.
///
/// `x` is treated as zero past its end. When `y` precedes `x` by exactly
/// `lookahead` samples the leading `lookahead` taps come out near zero.
pub fn estimate(x: &[f64], y: &[f64], order: usize, lookahead: usize) -> Result<Vec<f64>> {
    let taps = order + lookahead;
    let first = order.saturating_sub(1);
    if taps == 0 || y.len() < first + taps {
        return Err(ModemError::InvalidInputSize);
    }

    let sample = |index: usize| x.get(index).copied().unwrap_or(0.0);
    let columns: Vec<Vec<f64>> = (0..taps)
        .map(|i| (first..y.len()).map(|k| sample(k + lookahead - i)).collect())
        .collect();
    let rhs = y[first..].to_vec();

    Ok(least_squares(columns, rhs))
}

/// Solve `min |A·h − b|` by Householder QR. `columns[j]` is column `j` of A.
fn least_squares(mut columns: Vec<Vec<f64>>, mut b: Vec<f64>) -> Vec<f64> {
    let n = columns.len();
    let mut diag = vec![0.0; n];

    for k in 0..n {
        let norm_k = norm(&columns[k][k..]);
        if norm_k == 0.0 {
            continue;
        }
        let alpha = if columns[k][k] > 0.0 { -norm_k } else { norm_k };
        columns[k][k] -= alpha;
        diag[k] = alpha;

        let (head, tail) = columns.split_at_mut(k + 1);
        let v = &head[k][k..];
        let v_norm2: f64 = v.iter().map(|x| x * x).sum();
        if v_norm2 == 0.0 {
            continue;
        }

        for column in tail.iter_mut() {
            let s = 2.0 * dot(v, &column[k..]) / v_norm2;
            for (c, vi) in column[k..].iter_mut().zip(v) {
                *c -= s * vi;
            }
        }
        let s = 2.0 * dot(v, &b[k..]) / v_norm2;
        for (bi, vi) in b[k..].iter_mut().zip(v) {
            *bi -= s * vi;
        }
    }

    let largest = diag.iter().fold(0.0f64, |m, d| m.max(d.abs()));
    let mut h = vec![0.0; n];
    for k in (0..n).rev() {
        if diag[k].abs() <= largest * 1e-13 {
            continue;
        }
        let s: f64 = (k + 1..n).map(|j| columns[j][k] * h[j]).sum();
        h[k] = (b[k] - s) / diag[k];
    }
    h
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Splits an interpolated sample stream into per-carrier complex symbols.
///
/// Each block of `nsym` samples is projected onto `exp(−j·ω·k)·2/nsym` for
/// every carrier, so a real tone `Re(s·exp(j·ω·k))` comes out as `s`.
pub struct Demux<S> {
    sampler: S,
    filters: Vec<Vec<Complex64>>,
    nsym: usize,
}

impl<S: Take> Demux<S> {
    pub fn new(sampler: S, omegas: &[f64], nsym: usize) -> Self {
        let scale = 1.0 / (0.5 * nsym as f64);
        let filters = omegas
            .iter()
            .map(|&omega| exp_iwt(-omega, nsym).into_iter().map(|h| h * scale).collect())
            .collect();
        Self {
            sampler,
            filters,
            nsym,
        }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    /// Project one block of samples onto every carrier.
    pub fn demodulate(&self, frame: &[f64]) -> Vec<Complex64> {
        self.filters
            .iter()
            .map(|filter| filter.iter().zip(frame).map(|(h, &x)| h * x).sum())
            .collect()
    }
}

impl<S: Take> Iterator for Demux<S> {
    type Item = Result<Vec<Complex64>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.sampler.take(self.nsym) {
            Ok(frame) if frame.len() == self.nsym => Some(Ok(self.demodulate(&frame))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(a: &[f64], b: &[f64], tolerance: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < tolerance, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn test_fir_keeps_history() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut whole = Fir::new(vec![0.5, 0.25, -1.0]);
        let expected = whole.process(&x);
        assert_approx(&expected, &[0.5, 1.25, 1.0, 0.75, 0.5], 1e-12);

        let mut split = Fir::new(vec![0.5, 0.25, -1.0]);
        let mut y = split.process(&x[..2]);
        y.extend(split.process(&x[2..]));
        assert_approx(&y, &expected, 1e-12);
    }

    #[test]
    fn test_iir_impulse_response() {
        let mut impulse = vec![0.0; 6];
        impulse[0] = 1.0;
        let y = lfilter(&[1.0], &[1.0, -0.5], &impulse).unwrap();
        assert_approx(&y, &[1.0, 0.5, 0.25, 0.125, 0.0625, 0.03125], 1e-12);
        assert!(Iir::new(&[1.0], &[0.0, 1.0]).is_err());
    }

    #[test]
    fn test_iir_inverts_fir() {
        let x: Vec<f64> = (0..50).map(|i| ((i * 37) % 11) as f64 - 5.0).collect();
        let y = Fir::new(vec![1.0, -0.3]).process(&x);
        let z = lfilter(&[1.0], &[1.0, -0.3], &y).unwrap();
        assert_approx(&z, &x, 1e-9);
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[3.0, -4.0]) - (12.5f64).sqrt()).abs() < 1e-12);
        let tone: Vec<f64> = (0..64).map(|k| (2.0 * PI * k as f64 / 16.0).sin()).collect();
        assert!((rms(&tone) - 0.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_coherence() {
        let n = 32;
        let omega = 2.0 * PI * 4.0 / n as f64;
        let tone: Vec<f64> = (0..n).map(|k| (omega * k as f64 + 0.3).cos()).collect();
        assert!((coherence(&tone, omega).norm() - 1.0).abs() < 1e-12);

        let other: Vec<f64> = (0..n).map(|k| (2.0 * omega * k as f64).cos()).collect();
        assert!(coherence(&other, omega).norm() < 1e-12);
        assert_eq!(coherence(&vec![0.0; n], omega).norm(), 0.0);
    }

    #[test]
    fn test_linear_regression() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| 3.0 * v - 2.0).collect();
        let (a, b) = linear_regression(&x, &y);
        assert!((a - 3.0).abs() < 1e-12);
        assert!((b + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unwrap() {
        let phases: Vec<f64> = (0..20).map(|i| (0.9 * i as f64 + PI) % (2.0 * PI) - PI).collect();
        let unwrapped = unwrap(&phases);
        for pair in unwrapped.windows(2) {
            assert!((pair[1] - pair[0] - 0.9).abs() < 1e-9);
        }
    }

    #[test]
    fn test_prbs_is_deterministic() {
        let a: Vec<u64> = prbs(1, 0x1100b, 2).take(100).collect();
        let b: Vec<u64> = prbs(1, 0x1100b, 2).take(100).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| v < 4));
        assert_eq!(&a[..4], &[1, 2, 0, 0]);
        assert!(a.iter().any(|&v| v == 3));
    }

    #[test]
    fn test_estimate_delayed_channel() {
        let x: Vec<f64> = (0..200).map(|i| ((i * 7919) % 101) as f64 / 50.0 - 1.0).collect();
        // y[k] = x[k + 1]: the ideal kernel is a single tap at index lookahead - 1
        let y: Vec<f64> = x[1..].to_vec();
        let h = estimate(&x, &y, 3, 2).unwrap();
        assert_approx(&h, &[0.0, 1.0, 0.0, 0.0, 0.0], 1e-9);
    }

    #[test]
    fn test_estimate_rejects_short_input() {
        assert!(estimate(&[1.0, 2.0], &[1.0, 2.0], 3, 2).is_err());
    }

    struct Ramp(f64);

    impl Take for Ramp {
        fn take(&mut self, size: usize) -> Result<Vec<f64>> {
            if self.0 > 1.0 {
                return Ok(Vec::new());
            }
            self.0 += 1.0;
            let omega = 2.0 * PI * 3.0 / size as f64;
            Ok((0..size)
                .map(|k| 0.5 * (omega * k as f64).cos() - 0.25 * (2.0 * omega * k as f64).sin())
                .collect())
        }
    }

    #[test]
    fn test_demux() {
        let nsym = 32;
        let omegas = [2.0 * PI * 3.0 / nsym as f64, 2.0 * PI * 6.0 / nsym as f64];
        let demux = Demux::new(Ramp(0.0), &omegas, nsym);
        let symbols: Vec<Vec<Complex64>> = demux.map(|s| s.unwrap()).collect();
        assert_eq!(symbols.len(), 2);
        for row in symbols {
            assert!((row[0] - Complex64::new(0.5, 0.0)).norm() < 1e-12);
            assert!((row[1] - Complex64::new(0.0, 0.25)).norm() < 1e-12);
        }
    }
}
