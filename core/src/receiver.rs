//! Receive path: PCM in, bytes out
//!
//! ```text
//! SKIP -> DETECT -> PREFIX -> TRAIN -> DEMOD -> DRAIN -> DONE
//!            \         \         \        \
//!             +---------+---------+--------+--> FAIL
//! ```

use crate::common::{self, PcmSamples};
use crate::config::Configuration;
use crate::detect::Detector;
use crate::dsp::{Demux, Fir};
use crate::equalizer::{self, Equalizer, EQUALIZER_LENGTH, SILENCE_LENGTH};
use crate::error::{ModemError, Result};
use crate::framing;
use crate::qam::Qam;
use crate::sampling::{Interpolator, Sampler, Take};
use crate::stream::Dumper;
use log::{debug, error, info};
use num_complex::Complex64;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

/// Largest tolerated sender/receiver clock mismatch
pub const FREQUENCY_TOLERANCE: f64 = 2e-4;

/// Equalizer taps looking back
const EQUALIZER_ORDER: usize = 20;

/// Equalizer taps looking ahead
const EQUALIZER_LOOKAHEAD: usize = 20;

/// Symbol periods between sampler phase and frequency updates
const ITERS_PER_UPDATE: usize = 100;

/// Symbol periods between progress reports
const ITERS_PER_REPORT: usize = 1000;

/// Loop gain of the frequency correction, per symbol period
const FREQ_LOOP_GAIN: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Skip,
    Detect,
    Prefix,
    Train,
    Demod,
    Drain,
    Done,
    Fail,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReceiverState::Skip => "SKIP",
            ReceiverState::Detect => "DETECT",
            ReceiverState::Prefix => "PREFIX",
            ReceiverState::Train => "TRAIN",
            ReceiverState::Demod => "DEMOD",
            ReceiverState::Drain => "DRAIN",
            ReceiverState::Done => "DONE",
            ReceiverState::Fail => "FAIL",
        };
        f.write_str(name)
    }
}

/// Measurements from one reception
#[derive(Debug, Clone)]
pub struct ReceiverStats {
    /// Received carrier amplitude
    pub amplitude: f64,
    /// Sender clock relative to ours, in parts per million
    pub freq_err_ppm: f64,
    /// First carrier sample, counted after the skipped lead-in
    pub carrier_start: usize,
    /// Per-carrier SNR measured on the training sequence (dB)
    pub snr_db: Vec<f64>,
    /// Demodulated bits
    pub bits: usize,
    /// Codewords decoded, end of stream included
    pub frames: usize,
    /// Payload bytes written to the sink
    pub bytes: usize,
    pub state: ReceiverState,
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self {
            amplitude: 0.0,
            freq_err_ppm: 0.0,
            carrier_start: 0,
            snr_db: Vec::new(),
            bits: 0,
            frames: 0,
            bytes: 0,
            state: ReceiverState::Skip,
        }
    }
}

pub struct Receiver<'a> {
    config: &'a Configuration,
    qam: Qam,
    interp: Arc<Interpolator>,
    stats: ReceiverStats,
}

impl<'a> Receiver<'a> {
    pub fn new(config: &'a Configuration) -> Result<Self> {
        Ok(Self {
            config,
            qam: Qam::new(&config.symbols)?,
            interp: Arc::new(Interpolator::default()),
            stats: ReceiverStats::default(),
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.stats.state
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    fn transition(&mut self, state: ReceiverState) {
        debug!("Receiver: {} -> {}", self.stats.state, state);
        self.stats.state = state;
    }

    /// Demodulate `src` into `dst` until the end-of-stream frame.
    ///
    /// On failure the receiver is left in [`ReceiverState::Fail`].
    pub fn run<R: Read, W: Write>(&mut self, src: R, dst: W) -> Result<()> {
        let result = self.receive(src, dst);
        if result.is_err() {
            self.transition(ReceiverState::Fail);
        }
        result
    }

    fn receive<R: Read, W: Write>(&mut self, src: R, mut dst: W) -> Result<()> {
        let config = self.config;
        let mut samples = PcmSamples::new(src);
        let saturation = samples.saturation_check();

        self.transition(ReceiverState::Skip);
        common::take(&mut samples, config.samples(config.skip_start))?;

        self.transition(ReceiverState::Detect);
        let detection = Detector::new(config).run(samples)?;
        if detection.amplitude <= 0.0 {
            return Err(ModemError::NoCarrier);
        }
        let freq = 1.0 / (1.0 + detection.freq_err);
        let gain = 1.0 / detection.amplitude;
        self.stats.amplitude = detection.amplitude;
        self.stats.freq_err_ppm = detection.freq_err * 1e6;
        self.stats.carrier_start = detection.start;
        debug!(
            "Frequency correction: {:.3} ppm, gain: {:.3}",
            (freq - 1.0) * 1e6,
            gain
        );
        if (freq - 1.0).abs() > FREQUENCY_TOLERANCE {
            return Err(ModemError::FrequencyOutOfRange {
                ppm: self.stats.freq_err_ppm,
            });
        }

        let sampler = Sampler::new(detection.samples, self.interp.clone(), freq);
        let mut demux = Demux::new(sampler, &config.omegas(), config.nsym);

        self.transition(ReceiverState::Prefix);
        self.prefix(&mut demux, gain)?;
        saturation.set_enabled(false);

        self.transition(ReceiverState::Train);
        let mut filt = self.train(demux.sampler_mut())?;
        demux
            .sampler_mut()
            .set_equalizer(Box::new(move |frame: &mut [f64]| filt.process_in_place(frame)));

        self.transition(ReceiverState::Demod);
        info!("Starting demodulation");
        let demodulator = Demodulator::new(demux, &self.qam, config.tsym);
        let mut frames = framing::decode_frames(demodulator);
        let mut result = Ok(());
        for frame in frames.by_ref() {
            match frame {
                Ok(payload) => {
                    dst.write_all(&payload).map_err(ModemError::Sink)?;
                    dst.flush().map_err(ModemError::Sink)?;
                    self.stats.bytes += payload.len();
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.stats.frames = frames.decoded();
        self.stats.bits = frames.bits_mut().bits;
        drop(frames);

        result.map_err(|e| match e {
            ModemError::BadChecksum { .. } | ModemError::EccUnrecoverable(_) => {
                ModemError::DecodeFailed {
                    frame: self.stats.frames.saturating_sub(1),
                    source: Box::new(e),
                }
            }
            other => other,
        })?;

        self.transition(ReceiverState::Drain);
        dst.flush().map_err(ModemError::Sink)?;
        self.transition(ReceiverState::Done);
        Ok(())
    }

    /// Check the on/off carrier pattern opening the transmission.
    fn prefix<S: Take>(&mut self, demux: &mut Demux<S>, gain: f64) -> Result<()> {
        let index = self.config.carrier_index;
        let mut errors = 0;
        for &expected in &equalizer::prefix() {
            let symbols = demux.next().ok_or(ModemError::Truncated)??;
            let bit = (symbols[index] * gain).norm().round();
            if bit != expected {
                errors += 1;
            }
        }
        if errors > 0 {
            return Err(ModemError::BadPrefix { errors });
        }
        debug!("Prefix OK");
        Ok(())
    }

    /// Fit the channel equalizer on the training sequence.
    ///
    /// The returned filter has already processed the whole training capture,
    /// so it continues seamlessly into the payload.
    fn train<S: Take>(&mut self, sampler: &mut S) -> Result<Fir> {
        let config = self.config;
        let nsym = config.nsym;
        let equalizer = Equalizer::new(config);

        let symbols = equalizer.train_symbols(EQUALIZER_LENGTH);
        let nfreq = config.nfreq() as f64;
        let mut expected: Vec<f64> = equalizer
            .modulator(&symbols)
            .iter()
            .map(|x| x * nfreq)
            .collect();
        expected.resize(expected.len() + EQUALIZER_LOOKAHEAD, 0.0);

        let prefix = SILENCE_LENGTH * nsym;
        let postfix = SILENCE_LENGTH * nsym;
        let signal_length = EQUALIZER_LENGTH * nsym + prefix + postfix;
        let signal = sampler.take(signal_length + EQUALIZER_LOOKAHEAD)?;
        if signal.len() < signal_length + EQUALIZER_LOOKAHEAD {
            return Err(ModemError::Truncated);
        }

        let coeffs = equalizer::train(
            &signal[prefix..signal.len() - postfix],
            &expected,
            EQUALIZER_ORDER,
            EQUALIZER_LOOKAHEAD,
        )?;
        let mut filt = Fir::new(coeffs);
        let equalized = filt.process(&signal);
        let equalized = &equalized
            [prefix + EQUALIZER_LOOKAHEAD..signal_length - postfix + EQUALIZER_LOOKAHEAD];

        self.verify_training(&equalizer, equalized, &symbols)?;
        Ok(filt)
    }

    fn verify_training(
        &mut self,
        equalizer: &Equalizer<'_>,
        equalized: &[f64],
        expected: &[Vec<Complex64>],
    ) -> Result<()> {
        let received = equalizer.demodulator(equalized, expected.len())?;
        let nfreq = self.config.nfreq();

        let mut errors = 0;
        let mut signal_power = vec![0.0; nfreq];
        let mut noise_power = vec![0.0; nfreq];
        for (row, sent) in received.iter().zip(expected) {
            for (m, (r, s)) in row.iter().zip(sent).enumerate() {
                if r.re.round() != s.re || r.im.round() != s.im {
                    errors += 1;
                }
                signal_power[m] += s.norm_sqr();
                noise_power[m] += (r - s).norm_sqr();
            }
        }

        self.stats.snr_db = signal_power
            .iter()
            .zip(&noise_power)
            .map(|(signal, noise)| 10.0 * (signal / noise).log10())
            .collect();
        for (freq, snr) in self.config.frequencies.iter().zip(&self.stats.snr_db) {
            debug!("{:5.1} kHz: SNR = {:5.2} dB", freq / 1e3, snr);
        }

        if errors > 0 {
            error!("Training failed: {} symbol errors", errors);
            return Err(ModemError::TrainingFailed {
                errors,
                total: expected.len() * nfreq,
            });
        }
        debug!("Training completed");
        Ok(())
    }
}

/// Bit stream demodulated from equalized symbols, with sampler tracking.
///
/// Every [`ITERS_PER_UPDATE`] symbol periods the mean phase error between
/// received and decoded symbols nudges the sampler's offset and frequency.
struct Demodulator<'q, I> {
    demux: Demux<Sampler<I>>,
    qam: &'q Qam,
    tsym: f64,
    pending: VecDeque<bool>,
    errors: Vec<Complex64>,
    symbols: usize,
    bits: usize,
}

impl<'q, I> Demodulator<'q, I>
where
    I: Iterator<Item = Result<f64>>,
{
    fn new(demux: Demux<Sampler<I>>, qam: &'q Qam, tsym: f64) -> Self {
        Self {
            demux,
            qam,
            tsym,
            pending: VecDeque::new(),
            errors: Vec::new(),
            symbols: 0,
            bits: 0,
        }
    }

    fn update_sampler(&mut self) {
        if self.errors.is_empty() {
            return;
        }
        let mean = self.errors.iter().map(|e| e.arg()).sum::<f64>() / self.errors.len() as f64;
        let err = mean / (2.0 * PI);
        self.errors.clear();

        let sampler = self.demux.sampler_mut();
        sampler.set_freq(sampler.freq() - FREQ_LOOP_GAIN * err * self.tsym);
        sampler.set_offset(sampler.offset() - err);
    }

    fn report(&self) {
        debug!(
            "Got {:8.3} kB, drift: {:+6.2} ppm",
            self.bits as f64 / 8e3,
            (1.0 - self.demux.sampler().freq()) * 1e6
        );
    }
}

impl<I> Iterator for Demodulator<'_, I>
where
    I: Iterator<Item = Result<f64>>,
{
    type Item = Result<bool>;

    fn next(&mut self) -> Option<Result<bool>> {
        loop {
            if let Some(bit) = self.pending.pop_front() {
                self.bits += 1;
                return Some(Ok(bit));
            }

            let symbols = match self.demux.next()? {
                Ok(symbols) => symbols,
                Err(e) => return Some(Err(e)),
            };
            for received in symbols {
                let (decoded, bits) = self.qam.decode_symbol(received);
                if decoded.norm() > 0.0 {
                    self.errors.push(received / decoded);
                }
                self.pending.extend(bits);
            }

            self.symbols += 1;
            if self.symbols % ITERS_PER_UPDATE == 0 {
                self.update_sampler();
            }
            if self.symbols % ITERS_PER_REPORT == 0 {
                self.report();
            }
        }
    }
}

/// Receive one transmission, returning the session statistics.
///
/// Every PCM byte read is also copied to `dump_audio` when given.
pub fn try_recv<R: Read, W: Write>(
    config: &Configuration,
    src: R,
    dst: W,
    dump_audio: Option<&mut dyn Write>,
) -> Result<ReceiverStats> {
    let start = Instant::now();
    info!("Receiving: {}", config);

    let mut receiver = Receiver::new(config)?;
    receiver.run(Dumper::new(src, dump_audio), dst)?;

    let stats = receiver.stats().clone();
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        "Received {:.3} kB @ {:.3} seconds = {:.3} kB/s",
        stats.bytes as f64 / 1e3,
        elapsed,
        stats.bytes as f64 / 1e3 / elapsed.max(1e-9)
    );
    Ok(stats)
}

/// Receive one transmission; failures are logged and reported as `false`.
pub fn recv<R: Read, W: Write>(
    config: &Configuration,
    src: R,
    dst: W,
    dump_audio: Option<&mut dyn Write>,
) -> bool {
    match try_recv(config, src, dst, dump_audio) {
        Ok(_) => true,
        Err(e) => {
            match std::error::Error::source(&e) {
                Some(cause) => error!("Decoding failed: {} ({})", e, cause),
                None => error!("Decoding failed: {}", e),
            }
            false
        }
    }
}
