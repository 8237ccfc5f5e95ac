//! Fractional-delay resampling
//!
//! The receiver never assumes its sound card runs at exactly the sender's
//! rate. [`Sampler`] reads the recording at an adjustable fractional position,
//! interpolating between input samples with a polyphase windowed-sinc filter.

use crate::error::Result;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;

/// A source of blocks of real samples.
///
/// `take` returns fewer than `size` samples only when the source is exhausted.
pub trait Take {
    fn take(&mut self, size: usize) -> Result<Vec<f64>>;
}

/// Post-interpolation filter applied in place to every block a [`Sampler`] returns
pub type PostFilter = Box<dyn FnMut(&mut [f64])>;

/// Windowed-sinc filter bank split into `resolution` phases of `2·width` taps.
#[derive(Debug, Clone)]
pub struct Interpolator {
    resolution: usize,
    width: usize,
    filt: Vec<Vec<f64>>,
}

impl Interpolator {
    pub fn new(resolution: usize, width: usize) -> Self {
        let resolution = resolution.max(1);
        let width = width.max(1);
        let n = (resolution * width) as i64;

        let h: Vec<f64> = (-n..n)
            .map(|u| {
                let window = (0.5 * PI * u as f64 / n as f64).cos().powi(2);
                sinc(u, resolution as i64) * window
            })
            .collect();

        let filt = (0..resolution)
            .map(|phase| {
                let mut taps: Vec<f64> = h.iter().skip(phase).step_by(resolution).copied().collect();
                taps.reverse();
                taps
            })
            .collect();

        Self {
            resolution,
            width,
            filt,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Taps per filter phase
    pub fn coeff_len(&self) -> usize {
        2 * self.width
    }

    pub fn filter(&self, phase: usize) -> &[f64] {
        &self.filt[phase]
    }
}

impl Default for Interpolator {
    fn default() -> Self {
        Self::new(1024, 128)
    }
}

/// `sinc(u / resolution)`, exactly zero at the nonzero integer crossings
fn sinc(u: i64, resolution: i64) -> f64 {
    if u == 0 {
        return 1.0;
    }
    if u % resolution == 0 {
        return 0.0;
    }
    let x = PI * u as f64 / resolution as f64;
    x.sin() / x
}

/// Interpolating reader over a fallible sample stream.
///
/// Output sample `n` is the input evaluated at fractional position
/// `offset − width − 1`, after which `offset` advances by `freq`. The source is
/// preceded by `width` zeros so the first output lines up with input sample 0.
pub struct Sampler<I> {
    src: I,
    interp: Arc<Interpolator>,
    freq: f64,
    offset: f64,
    padding: usize,
    buff: VecDeque<f64>,
    index: usize,
    exhausted: bool,
    equalizer: Option<PostFilter>,
}

impl<I> Sampler<I>
where
    I: Iterator<Item = Result<f64>>,
{
    pub fn new(src: I, interp: Arc<Interpolator>, freq: f64) -> Self {
        let width = interp.width();
        let buff = VecDeque::from(vec![0.0; interp.coeff_len()]);
        Self {
            src,
            interp,
            freq,
            offset: (width + 1) as f64,
            padding: width,
            buff,
            index: 0,
            exhausted: false,
            equalizer: None,
        }
    }

    /// Input samples consumed per output sample
    pub fn freq(&self) -> f64 {
        self.freq
    }

    pub fn set_freq(&mut self, freq: f64) {
        self.freq = freq;
    }

    /// Current read position, in input samples
    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
    }

    /// Install a filter run over every block returned from now on.
    pub fn set_equalizer(&mut self, equalizer: PostFilter) {
        self.equalizer = Some(equalizer);
    }

    fn next_input(&mut self) -> Option<Result<f64>> {
        if self.padding > 0 {
            self.padding -= 1;
            return Some(Ok(0.0));
        }
        self.src.next()
    }
}

impl<I> Take for Sampler<I>
where
    I: Iterator<Item = Result<f64>>,
{
    fn take(&mut self, size: usize) -> Result<Vec<f64>> {
        let mut frame = Vec::with_capacity(size);
        let resolution = self.interp.resolution();
        let width = self.interp.width();

        'frame: while frame.len() < size && !self.exhausted {
            let offset = self.offset.max(0.0);
            let k = offset.floor();
            let phase = (((offset - k) * resolution as f64) as usize).min(resolution - 1);
            let end = k as usize + width;

            while self.index < end {
                match self.next_input() {
                    Some(Ok(sample)) => {
                        self.buff.pop_front();
                        self.buff.push_back(sample);
                        self.index += 1;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        self.exhausted = true;
                        break 'frame;
                    }
                }
            }

            let coeffs = self.interp.filter(phase);
            let value = coeffs.iter().zip(&self.buff).map(|(c, x)| c * x).sum();
            frame.push(value);
            self.offset += self.freq;
        }

        if let Some(equalizer) = self.equalizer.as_mut() {
            equalizer(&mut frame);
        }
        Ok(frame)
    }
}
