//! Byte framing: CRC-32, length prefix, Reed-Solomon and bit serialization
//!
//! Each block of up to [`BLOCK_SIZE`] payload bytes becomes one codeword:
//!
//! ```text
//! | len (1) | CRC-32 BE (4) | payload (..218) | zero padding | RS parity (32) |
//! |<------------------------ 223 ---------------------------->|
//! |<------------------------------ 255 ------------------------------------->|
//! ```
//!
//! `len` counts the CRC and payload bytes. A codeword with an empty payload
//! marks the end of the stream. Codewords are serialized least significant
//! bit first.

use crate::error::{ModemError, Result};
use crate::fec::{FecDecoder, FecEncoder};
use crate::{BLOCK_SIZE, RS_DATA_BYTES, RS_TOTAL_BYTES};
use log::{debug, warn};

/// Bytes of CRC-32 in front of every payload
pub const CHECKSUM_SIZE: usize = 4;

/// IEEE 802.3 CRC-32 (reflected polynomial 0xEDB88320)
pub fn crc32(data: &[u8]) -> u32 {
    const POLYNOMIAL: u32 = 0xEDB8_8320;
    let mut crc = 0xFFFF_FFFFu32;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

pub struct Checksum;

impl Checksum {
    /// Prefix `payload` with its big-endian CRC-32
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(CHECKSUM_SIZE + payload.len());
        frame.extend_from_slice(&crc32(payload).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Verify and strip the CRC-32 prefix
    pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < CHECKSUM_SIZE {
            return Err(ModemError::Truncated);
        }
        let (header, payload) = frame.split_at(CHECKSUM_SIZE);
        let received = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let expected = crc32(payload);
        if received != expected {
            return Err(ModemError::BadChecksum { received, expected });
        }
        Ok(payload.to_vec())
    }
}

/// Converts payload blocks to codewords and back.
pub struct Framer {
    encoder: FecEncoder,
    decoder: FecDecoder,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            encoder: FecEncoder::new(),
            decoder: FecDecoder::new(),
        }
    }

    /// Build the codeword for one block of at most BLOCK_SIZE bytes.
    ///
    /// An empty block yields the end-of-stream codeword.
    pub fn pack(&self, block: &[u8]) -> Result<Vec<u8>> {
        if block.len() > BLOCK_SIZE {
            return Err(ModemError::InvalidInputSize);
        }
        let framed = Checksum::encode(block);
        let mut packed = Vec::with_capacity(RS_DATA_BYTES);
        packed.push(framed.len() as u8);
        packed.extend_from_slice(&framed);
        self.encoder.encode(&packed)
    }

    /// Codewords for `data`, followed by the end-of-stream codeword
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut codewords = data
            .chunks(BLOCK_SIZE)
            .map(|block| self.pack(block))
            .collect::<Result<Vec<_>>>()?;
        codewords.push(self.pack(&[])?);
        Ok(codewords)
    }

    /// Recover the payload of one codeword. Empty means end of stream.
    pub fn unpack(&self, chunk: &[u8]) -> Result<Vec<u8>> {
        let packed = self.decoder.decode(chunk)?;
        let length = packed[0] as usize;
        if length < CHECKSUM_SIZE || length + 1 > packed.len() {
            let header = &packed[1..1 + CHECKSUM_SIZE];
            let received = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let end = (1 + length).clamp(1 + CHECKSUM_SIZE, packed.len());
            let expected = crc32(&packed[1 + CHECKSUM_SIZE..end]);
            warn!("Dropping frame: length byte {} out of range", length);
            return Err(ModemError::BadChecksum { received, expected });
        }
        Checksum::decode(&packed[1..1 + length]).map_err(|e| {
            warn!("Dropping frame: {}", e);
            e
        })
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand bytes into bits, least significant first
pub fn encode_bits<'a, I>(data: I) -> impl Iterator<Item = bool> + 'a
where
    I: IntoIterator<Item = u8>,
    I::IntoIter: 'a,
{
    data.into_iter()
        .flat_map(|byte| (0..8).map(move |k| (byte >> k) & 1 == 1))
}

/// Pack bits back into bytes; a trailing partial byte is dropped.
pub fn to_bytes(bits: &[bool]) -> Vec<u8> {
    bits.chunks_exact(8)
        .map(|byte| {
            byte.iter()
                .enumerate()
                .fold(0u8, |acc, (k, &bit)| acc | ((bit as u8) << k))
        })
        .collect()
}

/// Serialize `data` as the bit stream of its codewords, end of stream included.
pub fn encode(data: &[u8]) -> Result<Vec<bool>> {
    let codewords = Framer::new().encode(data)?;
    Ok(encode_bits(codewords.into_iter().flatten()).collect())
}

/// Decode payloads from a bit stream until the end-of-stream codeword.
pub fn decode_frames<I>(bits: I) -> Frames<I::IntoIter>
where
    I: IntoIterator<Item = Result<bool>>,
{
    Frames {
        bits: bits.into_iter(),
        framer: Framer::new(),
        done: false,
        count: 0,
    }
}

/// Iterator over decoded payloads. Fuses after the end of stream or an error.
pub struct Frames<I> {
    bits: I,
    framer: Framer,
    done: bool,
    count: usize,
}

impl<I> Frames<I> {
    /// Codewords decoded so far, end of stream included
    pub fn decoded(&self) -> usize {
        self.count
    }

    pub fn bits_mut(&mut self) -> &mut I {
        &mut self.bits
    }
}

impl<I> Iterator for Frames<I>
where
    I: Iterator<Item = Result<bool>>,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut bits = Vec::with_capacity(RS_TOTAL_BYTES * 8);
        for bit in self.bits.by_ref().take(RS_TOTAL_BYTES * 8) {
            match bit {
                Ok(bit) => bits.push(bit),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        if bits.len() < RS_TOTAL_BYTES * 8 {
            self.done = true;
            return Some(Err(ModemError::Truncated));
        }

        let result = self.framer.unpack(&to_bytes(&bits));
        self.count += 1;
        match result {
            Ok(payload) if payload.is_empty() => {
                debug!("End of stream after {} frames", self.count);
                self.done = true;
                None
            }
            Ok(payload) => Some(Ok(payload)),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
