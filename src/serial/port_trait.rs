//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Read available bytes into `buf`, waiting until at least one arrives
    ///
    /// Returns `Ok(0)` at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Wrapper around tokio_serial::SerialStream that implements SerialPortIO
pub struct TokioSerialPort {
    port: tokio_serial::SerialStream,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self { port }
    }
}

#[async_trait]
impl SerialPortIO for TokioSerialPort {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        self.port.read(buf).await
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted outcome of a `read` call
    #[derive(Debug, Clone)]
    pub enum MockRead {
        /// Bytes delivered by one read
        Data(Vec<u8>),
        /// The read fails with this error kind
        Error(io::ErrorKind),
        /// End of stream
        Eof,
    }

    /// Mock serial port for testing
    ///
    /// Reads are served from a shared script; once it is exhausted the port
    /// goes silent (reads never complete), like an idle device.
    #[derive(Clone)]
    pub struct MockSerialPort {
        pub script: Arc<Mutex<VecDeque<MockRead>>>,
        pub reads: Arc<Mutex<usize>>,
    }

    impl MockSerialPort {
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                reads: Arc::new(Mutex::new(0)),
            }
        }

        /// Port that delivers `lines`, one read per line, then goes silent
        pub fn with_lines(lines: &[&str]) -> Self {
            let port = Self::new();
            for line in lines {
                port.push_data(format!("{}\r\n", line).as_bytes());
            }
            port
        }

        pub fn push_data(&self, data: &[u8]) {
            self.script.lock().unwrap().push_back(MockRead::Data(data.to_vec()));
        }

        pub fn push_error(&self, kind: io::ErrorKind) {
            self.script.lock().unwrap().push_back(MockRead::Error(kind));
        }

        pub fn push_eof(&self) {
            self.script.lock().unwrap().push_back(MockRead::Eof);
        }

        pub fn read_count(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    #[async_trait]
    impl SerialPortIO for MockSerialPort {
        async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let next = self.script.lock().unwrap().pop_front();
            *self.reads.lock().unwrap() += 1;

            match next {
                Some(MockRead::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        // Serve the remainder on the next read
                        self.script
                            .lock()
                            .unwrap()
                            .push_front(MockRead::Data(data[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(MockRead::Error(kind)) => Err(io::Error::new(kind, "Mock read error")),
                Some(MockRead::Eof) => Ok(0),
                None => std::future::pending().await,
            }
        }
    }
}
