//! Byte stream adapters for audio input
//!
//! [`AsyncReader`] decouples a slow or bursty source (a pipe from a sound
//! card, usually) from the demodulator by reading it on a background thread.
//! [`Dumper`] copies everything read to a second sink for later inspection.

use log::{debug, warn};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

/// Bytes requested from the source per read
pub const CHUNK_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and the consumer
pub const QUEUE_DEPTH: usize = 64;

/// Tee: every byte read from `src` is also written to `dump`.
pub struct Dumper<'a, R> {
    src: R,
    dump: Option<&'a mut dyn Write>,
}

impl<'a, R: Read> Dumper<'a, R> {
    pub fn new(src: R, dump: Option<&'a mut dyn Write>) -> Self {
        Self { src, dump }
    }
}

impl<R: Read> Read for Dumper<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.src.read(buf)?;
        if let Some(dump) = self.dump.as_mut() {
            dump.write_all(&buf[..n])?;
        }
        Ok(n)
    }
}

/// Reads a source on a dedicated thread, handing chunks over a bounded queue.
///
/// The thread stops at end of input, on the first read error (which is
/// forwarded to the consumer) or once the reader is dropped.
pub struct AsyncReader {
    rx: Receiver<io::Result<Vec<u8>>>,
    current: VecDeque<u8>,
    done: bool,
    handle: Option<JoinHandle<()>>,
}

impl AsyncReader {
    pub fn new<R: Read + Send + 'static>(src: R) -> io::Result<Self> {
        Self::with_capacity(src, CHUNK_SIZE, QUEUE_DEPTH)
    }

    pub fn with_capacity<R: Read + Send + 'static>(
        src: R,
        chunk_size: usize,
        depth: usize,
    ) -> io::Result<Self> {
        if chunk_size == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "chunk size must be positive",
            ));
        }
        let (tx, rx) = mpsc::sync_channel(depth);
        let handle = thread::Builder::new()
            .name("audio-reader".to_string())
            .spawn(move || Self::reader_thread(src, chunk_size, tx))?;

        Ok(Self {
            rx,
            current: VecDeque::new(),
            done: false,
            handle: Some(handle),
        })
    }

    fn reader_thread<R: Read>(mut src: R, chunk_size: usize, tx: SyncSender<io::Result<Vec<u8>>>) {
        let mut total = 0usize;
        loop {
            let mut chunk = vec![0u8; chunk_size];
            match src.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    chunk.truncate(n);
                    total += n;
                    if tx.send(Ok(chunk)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Audio reader stopped: {}", e);
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
        debug!("Audio reader done after {} bytes", total);
    }
}

impl Read for AsyncReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            if self.done {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => self.current.extend(chunk),
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(_) => self.done = true,
            }
        }

        let n = buf.len().min(self.current.len());
        for (dst, src) in buf.iter_mut().zip(self.current.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Drop for AsyncReader {
    fn drop(&mut self) {
        // joining could block forever on an idle source
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_dumper_copies_input() {
        let data: Vec<u8> = (0..=255).collect();
        let mut dump = Vec::new();
        let mut out = Vec::new();
        {
            let mut dumper = Dumper::new(Cursor::new(data.clone()), Some(&mut dump as &mut dyn Write));
            dumper.read_to_end(&mut out).unwrap();
        }
        assert_eq!(out, data);
        assert_eq!(dump, data);
    }

    #[test]
    fn test_dumper_without_sink() {
        let mut dumper = Dumper::new(Cursor::new(vec![1u8, 2, 3]), None);
        let mut out = Vec::new();
        dumper.read_to_end(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn test_async_reader_preserves_order() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = AsyncReader::with_capacity(Cursor::new(data.clone()), 1000, 2).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_async_reader_small_reads() {
        let mut reader = AsyncReader::with_capacity(Cursor::new(b"abcdefg".to_vec()), 3, 1).unwrap();
        let mut buf = [0u8; 2];
        let mut out = Vec::new();
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefg");
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::UnexpectedEof, "device lost"))
        }
    }

    #[test]
    fn test_async_reader_forwards_errors() {
        let mut reader = AsyncReader::new(Broken).unwrap();
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(AsyncReader::with_capacity(Cursor::new(Vec::new()), 0, 1).is_err());
    }
}
