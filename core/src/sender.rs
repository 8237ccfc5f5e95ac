//! Transmit path: bytes in, PCM out
//!
//! A transmission is leading silence, the carrier prefix, the equalizer
//! training sequence between two silent gaps, the QAM-modulated codewords
//! and trailing silence.

use crate::common::{self, to_pcm};
use crate::config::Configuration;
use crate::equalizer::{self, Equalizer, EQUALIZER_LENGTH, SILENCE_LENGTH};
use crate::error::{ModemError, Result};
use crate::framing::{encode_bits, Framer};
use crate::qam::Qam;
use crate::BLOCK_SIZE;
use log::{debug, info, warn};
use num_complex::Complex64;
use std::io::{ErrorKind, Read, Write};

/// Summary of one transmission
#[derive(Debug, Clone, Default)]
pub struct SendStats {
    /// Payload bytes read from the source
    pub bytes: usize,
    /// PCM samples written to the sink
    pub samples: usize,
    /// Audio duration in seconds
    pub duration: f64,
}

/// Writes modulated audio to a PCM sink.
pub struct Sender<'a, W> {
    config: &'a Configuration,
    dst: W,
    gain: f64,
    qam: Qam,
    pilot: Vec<f64>,
    written: usize,
    clipped: bool,
}

impl<'a, W: Write> Sender<'a, W> {
    pub fn new(config: &'a Configuration, dst: W, gain: f64) -> Result<Self> {
        let qam = Qam::new(&config.symbols)?;
        let pilot = config.carriers()[config.carrier_index]
            .iter()
            .map(|c| c.re)
            .collect();
        Ok(Self {
            config,
            dst,
            gain,
            qam,
            pilot,
            written: 0,
            clipped: false,
        })
    }

    /// Scale by the gain and write as PCM.
    pub fn write(&mut self, samples: &[f64]) -> Result<()> {
        let scaled: Vec<f64> = samples.iter().map(|x| x * self.gain).collect();
        if !self.clipped && common::check_saturation(&scaled).is_err() {
            warn!("Output is clipped, reduce the gain (currently {})", self.gain);
            self.clipped = true;
        }
        self.dst.write_all(&to_pcm(&scaled)).map_err(ModemError::Sink)?;

        let fs = self.config.fs as usize;
        let before = self.written / fs;
        self.written += samples.len();
        if self.written / fs > before {
            debug!("Sent {:.1} seconds of audio", self.written as f64 / self.config.fs);
        }
        Ok(())
    }

    pub fn silence(&mut self, samples: usize) -> Result<()> {
        self.write(&vec![0.0; samples])
    }

    /// Carrier prefix followed by the equalizer training sequence
    pub fn start(&mut self) -> Result<()> {
        let nsym = self.config.nsym;

        let prefix: Vec<f64> = equalizer::prefix()
            .iter()
            .flat_map(|&b| self.pilot.iter().map(move |p| b * p))
            .collect();
        self.write(&prefix)?;

        let equalizer = Equalizer::new(self.config);
        let training = equalizer.modulator(&equalizer.train_symbols(EQUALIZER_LENGTH));
        self.silence(SILENCE_LENGTH * nsym)?;
        self.write(&training)?;
        self.silence(SILENCE_LENGTH * nsym)
    }

    /// Modulate `bits`, zero-padded to a whole number of symbol periods.
    pub fn modulate(&mut self, bits: &[bool]) -> Result<()> {
        let bits_per_baud = self.config.bits_per_baud;
        let mut bits = bits.to_vec();
        let remainder = bits.len() % bits_per_baud;
        if remainder != 0 {
            bits.resize(bits.len() + bits_per_baud - remainder, false);
        }

        let nfreq = self.config.nfreq();
        let nsym = self.config.nsym;
        let carriers = self.config.carriers();
        let scale = 1.0 / nfreq as f64;

        let symbols: Vec<Complex64> = self.qam.encode(bits).collect();
        let mut signal = Vec::with_capacity(symbols.len() / nfreq * nsym);
        for group in symbols.chunks_exact(nfreq) {
            signal.extend((0..nsym).map(|k| {
                let sum: Complex64 = group
                    .iter()
                    .zip(carriers)
                    .map(|(s, carrier)| s * carrier[k])
                    .sum();
                sum.re * scale
            }));
        }
        self.write(&signal)
    }

    /// Samples written so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.dst.flush().map_err(ModemError::Sink)
    }

    pub fn into_inner(self) -> W {
        self.dst
    }
}

/// Fill `buf` from `src`, stopping early only at end of input.
fn read_block<R: Read>(src: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ModemError::Source(e)),
        }
    }
    Ok(filled)
}

/// Transmit everything readable from `src` as PCM audio on `dst`.
///
/// `gain` scales every sample, `extra_silence` (seconds) is added to the
/// configured leading silence.
pub fn send<R: Read, W: Write>(
    config: &Configuration,
    mut src: R,
    dst: W,
    gain: f64,
    extra_silence: f64,
) -> Result<SendStats> {
    let mut sender = Sender::new(config, dst, gain)?;
    let framer = Framer::new();
    let bits_per_baud = config.bits_per_baud;

    sender.silence(config.samples(config.silence_start + extra_silence.max(0.0)))?;
    sender.start()?;
    let training = sender.written();
    info!(
        "Sending {:.3} seconds of training audio",
        training as f64 / config.fs
    );

    let mut pending: Vec<bool> = Vec::new();
    let mut bytes = 0;
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let size = read_block(&mut src, &mut block)?;
        if size == 0 {
            break;
        }
        bytes += size;
        pending.extend(encode_bits(framer.pack(&block[..size])?));

        let whole = pending.len() - pending.len() % bits_per_baud;
        sender.modulate(&pending[..whole])?;
        pending.drain(..whole);

        if size < BLOCK_SIZE {
            break;
        }
    }

    pending.extend(encode_bits(framer.pack(&[])?));
    sender.modulate(&pending)?;
    sender.silence(config.samples(config.silence_stop))?;
    sender.flush()?;

    let samples = sender.written();
    let duration = samples as f64 / config.fs;
    info!(
        "Sent {:.3} kB @ {:.3} seconds of audio",
        bytes as f64 / 1e3,
        (samples - training) as f64 / config.fs
    );
    Ok(SendStats {
        bytes,
        samples,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::to_float;
    use crate::detect::CARRIER_THRESHOLD;
    use crate::equalizer::{CARRIER_DURATION, CARRIER_SILENCE};
    use std::io::Cursor;

    fn header_samples(config: &Configuration) -> usize {
        config.samples(config.silence_start)
            + (CARRIER_DURATION + CARRIER_SILENCE + 2 * SILENCE_LENGTH + EQUALIZER_LENGTH)
                * config.nsym
    }

    #[test]
    fn test_transmission_layout() {
        let config = Configuration::fastest();
        let mut pcm = Vec::new();
        let stats = send(&config, Cursor::new(vec![0x42u8; 10]), &mut pcm, 1.0, 0.0).unwrap();

        assert_eq!(stats.bytes, 10);
        assert_eq!(pcm.len(), stats.samples * 2);
        let audio = to_float(&pcm);

        // two codewords, each 2040 bits, padded to whole symbol periods
        let bits = 2 * 255 * 8;
        let periods = (bits + config.bits_per_baud - 1) / config.bits_per_baud;
        let expected = header_samples(&config)
            + periods * config.nsym
            + config.samples(config.silence_stop);
        assert_eq!(audio.len(), expected);

        let lead = config.samples(config.silence_start);
        assert!(audio[..lead].iter().all(|&x| x == 0.0));
        // prefix starts with a full-scale cosine burst
        assert!((audio[lead] - 1.0).abs() < 1.0 / 32000.0);
        assert!(audio[lead..].iter().take(CARRIER_THRESHOLD * config.nsym).any(|&x| x < -0.9));
        assert!(audio[audio.len() - config.samples(config.silence_stop)..]
            .iter()
            .all(|&x| x == 0.0));
    }

    #[test]
    fn test_gain_and_extra_silence() {
        let config = Configuration::slowest();
        let mut loud = Vec::new();
        let mut quiet = Vec::new();
        send(&config, Cursor::new(b"x".to_vec()), &mut loud, 1.0, 0.0).unwrap();
        let stats = send(&config, Cursor::new(b"x".to_vec()), &mut quiet, 0.5, 0.25).unwrap();

        let loud = to_float(&loud);
        let quiet = to_float(&quiet);
        assert_eq!(quiet.len(), loud.len() + config.samples(0.25));

        let peak = |x: &[f64]| x.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!((peak(&quiet) - 0.5).abs() < 1e-3);
        assert!(peak(&loud) <= 1.0);
        assert!((stats.duration - quiet.len() as f64 / config.fs).abs() < 1e-12);
    }

    #[test]
    fn test_modulate_pads_to_symbol_period() {
        let config = Configuration::for_bitrate(8).unwrap();
        let mut sender = Sender::new(&config, Vec::new(), 1.0).unwrap();
        sender.modulate(&[true; 3]).unwrap();
        assert_eq!(sender.written(), config.nsym);
        sender.modulate(&[]).unwrap();
        assert_eq!(sender.written(), config.nsym);
        assert_eq!(sender.into_inner().len(), 2 * config.nsym);
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sink_error() {
        let config = Configuration::slowest();
        let result = send(&config, Cursor::new(b"x".to_vec()), FailingSink, 1.0, 0.0);
        assert!(matches!(result, Err(ModemError::Sink(_))));
    }
}
