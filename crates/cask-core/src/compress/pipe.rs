//! Bounded chunk pipe between a producing writer and a consuming reader.
//!
//! The write half blocks when the queue holds `PIPE_CAPACITY` chunks (that
//! is the backpressure), the read half splits a chunk across reads when it
//! exceeds the caller's buffer, and end-of-stream is a final chunk flagged
//! `is_last` (possibly with an empty payload). After end-of-stream every
//! read returns 0.

use std::io::{self, Read, Write};

use crossbeam_channel::{bounded, Receiver, Sender};

/// High-water mark: at most this many chunks are in flight.
pub const PIPE_CAPACITY: usize = 10;

/// Preferred chunk size for producers that read in a loop.
pub const PIPE_CHUNK_SIZE: usize = 64 * 1024;

struct Chunk {
    data: Vec<u8>,
    is_last: bool,
}

pub fn chunk_pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = bounded(PIPE_CAPACITY);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            eof: false,
        },
    )
}

pub struct PipeWriter {
    tx: Sender<Chunk>,
}

impl PipeWriter {
    /// Signal end-of-stream. Consumes the writer; the payload is empty.
    pub fn finish(self) -> io::Result<()> {
        self.tx
            .send(Chunk {
                data: Vec::new(),
                is_last: true,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // `send` blocks while the queue is full.
        self.tx
            .send(Chunk {
                data: buf.to_vec(),
                is_last: false,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.eof = chunk.is_last;
                    self.current = chunk.data;
                    self.pos = 0;
                }
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "pipe writer dropped without finishing",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_out_equal_bytes_in() {
        let (mut writer, mut reader) = chunk_pipe();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let collected = std::thread::scope(|s| {
            let producer = s.spawn(|| {
                for chunk in payload.chunks(PIPE_CHUNK_SIZE) {
                    writer.write_all(chunk).unwrap();
                }
                writer.finish().unwrap();
            });
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            producer.join().unwrap();
            out
        });

        assert_eq!(collected, payload);
    }

    #[test]
    fn chunk_larger_than_read_buffer_is_split() {
        let (mut writer, mut reader) = chunk_pipe();
        writer.write_all(&[7u8; 100]).unwrap();
        writer.finish().unwrap();

        let mut buf = [0u8; 64];
        let first = reader.read(&mut buf).unwrap();
        assert_eq!(first, 64);
        let second = reader.read(&mut buf).unwrap();
        assert_eq!(second, 36);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn order_is_preserved() {
        let (mut writer, mut reader) = chunk_pipe();
        writer.write_all(b"first-").unwrap();
        writer.write_all(b"second-").unwrap();
        writer.write_all(b"third").unwrap();
        writer.finish().unwrap();

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "first-second-third");
    }

    #[test]
    fn reads_after_eof_return_zero() {
        let (writer, mut reader) = chunk_pipe();
        writer.finish().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writer_dropped_without_finish_is_an_error() {
        let (writer, mut reader) = chunk_pipe();
        drop(writer);

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn full_queue_applies_backpressure() {
        let (mut writer, mut reader) = chunk_pipe();

        std::thread::scope(|s| {
            let producer = s.spawn(move || {
                // Capacity + a few extra; the extras block until the reader drains.
                for i in 0..(PIPE_CAPACITY + 3) {
                    writer.write_all(&[i as u8]).unwrap();
                }
                writer.finish().unwrap();
            });

            std::thread::sleep(std::time::Duration::from_millis(20));
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            producer.join().unwrap();
            assert_eq!(out.len(), PIPE_CAPACITY + 3);
        });
    }
}
