//! # Sensor Frame Reader
//!
//! Splits the serial byte stream into newline-delimited frames.
//!
//! - [`LineFramer`] is the pure, synchronous part: it buffers across read
//!   boundaries and resynchronizes after an overlong, terminator-less run.
//! - [`FrameReader`] drives a [`SerialPortIO`] through the framer and
//!   enforces the read liveness timeout.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::protocol::FRAME_TERMINATOR;
use crate::error::{LoggerError, Result};
use crate::serial::port_trait::SerialPortIO;

/// Default cap on a single frame, in bytes
pub const DEFAULT_MAX_FRAME_LEN: usize = 512;

/// Size of the buffer handed to each port read
const READ_CHUNK_SIZE: usize = 1024;

/// Output of the line framer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete, trimmed, non-empty line
    Frame(String),

    /// Bytes dropped because no terminator arrived within the cap
    Overflow { discarded: usize },
}

/// Newline framer with a bounded buffer
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_len: usize,
    /// Dropping bytes until the next terminator after an overflow
    resyncing: bool,
}

impl LineFramer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_len.min(4096)),
            max_len,
            resyncing: false,
        }
    }

    /// Feed raw bytes, returning every event they complete
    ///
    /// An overflow is reported once; the remainder of the overlong frame up to
    /// and including its terminator is dropped silently, and framing resumes
    /// with the following line.
    pub fn feed(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        self.buffer.extend_from_slice(data);

        loop {
            match self.buffer.iter().position(|&b| b == FRAME_TERMINATOR) {
                Some(pos) => {
                    let line = self.buffer.split_to(pos + 1);

                    if self.resyncing {
                        self.resyncing = false;
                        trace!("Resynchronized after {} trailing bytes", line.len());
                        continue;
                    }

                    if pos > self.max_len {
                        events.push(FrameEvent::Overflow {
                            discarded: line.len(),
                        });
                        continue;
                    }

                    let text = String::from_utf8_lossy(&line[..pos]);
                    let text = text.trim();
                    if !text.is_empty() {
                        events.push(FrameEvent::Frame(text.to_string()));
                    }
                }
                None => {
                    if self.resyncing {
                        self.buffer.clear();
                    } else if self.buffer.len() > self.max_len {
                        let discarded = self.buffer.len();
                        self.buffer.clear();
                        self.resyncing = true;
                        events.push(FrameEvent::Overflow { discarded });
                    }
                    break;
                }
            }
        }

        events
    }

    /// Drop any partial frame, returning how many bytes were discarded
    pub fn reset(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.resyncing = false;
        discarded
    }

    /// Bytes currently buffered without a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Pulls frames from a serial port on demand
pub struct FrameReader {
    port: Box<dyn SerialPortIO>,
    framer: LineFramer,
    pending: VecDeque<FrameEvent>,
    read_timeout: Duration,
    chunk: Vec<u8>,
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("framer", &self.framer)
            .field("pending", &self.pending.len())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl FrameReader {
    /// Create a reader over an open port
    ///
    /// # Arguments
    ///
    /// * `port` - Open serial port
    /// * `max_frame_len` - Frame cap before overflow
    /// * `read_timeout` - Longest silence tolerated before `ReadTimeout`
    pub fn new(port: Box<dyn SerialPortIO>, max_frame_len: usize, read_timeout: Duration) -> Self {
        Self {
            port,
            framer: LineFramer::new(max_frame_len),
            pending: VecDeque::new(),
            read_timeout,
            chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Wait for the next frame
    ///
    /// Cancel-safe: bytes already read stay buffered for the next call.
    ///
    /// # Errors
    ///
    /// - `FrameOverflow` - an overlong frame was dropped (recoverable, call again)
    /// - `ReadTimeout` - no bytes arrived within the read timeout
    /// - `DeviceLost` - end of stream or an I/O error from the port
    pub async fn next_frame(&mut self) -> Result<String> {
        let mut deadline = Instant::now() + self.read_timeout;

        loop {
            if let Some(event) = self.pending.pop_front() {
                return match event {
                    FrameEvent::Frame(frame) => Ok(frame),
                    FrameEvent::Overflow { discarded } => {
                        Err(LoggerError::FrameOverflow { discarded })
                    }
                };
            }

            let n = match timeout_at(deadline, self.port.read(&mut self.chunk)).await {
                Err(_) => return Err(LoggerError::ReadTimeout(self.read_timeout)),
                Ok(Ok(0)) => return Err(LoggerError::DeviceLost("end of stream".to_string())),
                Ok(Ok(n)) => n,
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Ok(Err(e)) => return Err(LoggerError::DeviceLost(e.to_string())),
            };

            deadline = Instant::now() + self.read_timeout;
            let events = self.framer.feed(&self.chunk[..n]);
            self.pending.extend(events);
        }
    }

    /// Take the complete frames (and overflow notices) already read from the
    /// port but not yet returned by [`next_frame`](Self::next_frame)
    pub fn drain(&mut self) -> Vec<FrameEvent> {
        self.pending.drain(..).collect()
    }

    /// Drop buffered partial data, e.g. after the device went away
    ///
    /// Queued complete frames are dropped too; [`drain`](Self::drain) them
    /// first.
    pub fn reset(&mut self) -> usize {
        self.pending.clear();
        let discarded = self.framer.reset();
        if discarded > 0 {
            debug!("Discarded {} bytes of partial frame", discarded);
        }
        discarded
    }

    /// Release the underlying port
    pub fn into_port(self) -> Box<dyn SerialPortIO> {
        self.port
    }
}
