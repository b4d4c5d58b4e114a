//! Trait abstraction for serial port operations to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::Result;

/// Trait for serial port I/O operations
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;

    /// Read up to and including `delimiter`
    ///
    /// Returns `UnexpectedEof` if the device closed the stream.
    async fn read_until(&mut self, delimiter: u8) -> io::Result<Vec<u8>>;
}

/// Opens serial ports for a reader or radio
///
/// Readers reopen their port after every failure, so they hold an opener
/// rather than a port.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>>;
}

/// Wrapper around tokio_serial::SerialStream that implements SerialPortIO
pub struct TokioSerialPort {
    port: BufReader<tokio_serial::SerialStream>,
}

impl TokioSerialPort {
    pub fn new(port: tokio_serial::SerialStream) -> Self {
        Self {
            port: BufReader::new(port),
        }
    }
}

#[async_trait]
impl SerialPortIO for TokioSerialPort {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.get_mut().write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.port.get_mut().flush().await
    }

    async fn read_until(&mut self, delimiter: u8) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        let n = self.port.read_until(delimiter, &mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial stream closed"));
        }
        Ok(buf)
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use crate::error::CartelemError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Mock serial port for testing
    ///
    /// Reads are served from a scripted queue. Writes are recorded and, when
    /// a reply is registered for the written command, the reply is queued.
    /// Once the queue is empty a read either fails with the configured error
    /// or never completes, like a silent device.
    #[derive(Clone)]
    pub struct MockSerialPort {
        pub written_data: Arc<Mutex<Vec<Vec<u8>>>>,
        pub incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub replies: Arc<Mutex<HashMap<String, String>>>,
        pub once_replies: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
        pub write_error: Arc<Mutex<Option<io::ErrorKind>>>,
        pub read_error: Arc<Mutex<Option<io::ErrorKind>>>,
    }

    impl MockSerialPort {
        pub fn new() -> Self {
            Self {
                written_data: Arc::new(Mutex::new(Vec::new())),
                incoming: Arc::new(Mutex::new(VecDeque::new())),
                replies: Arc::new(Mutex::new(HashMap::new())),
                once_replies: Arc::new(Mutex::new(HashMap::new())),
                write_error: Arc::new(Mutex::new(None)),
                read_error: Arc::new(Mutex::new(None)),
            }
        }

        /// Queue a line exactly as the device would send it
        pub fn push_line(&self, line: &str) {
            self.incoming.lock().unwrap().push_back(line.as_bytes().to_vec());
        }

        /// Reply sent whenever `command` is written (without the trailing CR)
        pub fn reply_to(&self, command: &str, reply: &str) {
            self.replies
                .lock()
                .unwrap()
                .insert(command.to_string(), reply.to_string());
        }

        /// Reply used once, ahead of any persistent reply
        pub fn reply_once(&self, command: &str, reply: &str) {
            self.once_replies
                .lock()
                .unwrap()
                .entry(command.to_string())
                .or_default()
                .push_back(reply.to_string());
        }

        pub fn get_written_data(&self) -> Vec<Vec<u8>> {
            self.written_data.lock().unwrap().clone()
        }

        /// Written commands with the line terminator stripped
        pub fn written_commands(&self) -> Vec<String> {
            self.get_written_data()
                .iter()
                .map(|d| String::from_utf8_lossy(d).trim().to_string())
                .collect()
        }

        pub fn count_written(&self, command: &str) -> usize {
            self.written_commands().iter().filter(|c| *c == command).count()
        }

        pub fn set_write_error(&self, error: io::ErrorKind) {
            *self.write_error.lock().unwrap() = Some(error);
        }

        pub fn set_read_error(&self, error: io::ErrorKind) {
            *self.read_error.lock().unwrap() = Some(error);
        }
    }

    #[async_trait]
    impl SerialPortIO for MockSerialPort {
        async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            if let Some(error) = *self.write_error.lock().unwrap() {
                return Err(io::Error::new(error, "Mock write error"));
            }
            self.written_data.lock().unwrap().push(data.to_vec());

            let command = String::from_utf8_lossy(data).trim().to_string();
            let once = self
                .once_replies
                .lock()
                .unwrap()
                .get_mut(&command)
                .and_then(|queue| queue.pop_front());
            let reply = once.or_else(|| self.replies.lock().unwrap().get(&command).cloned());
            match reply {
                Some(reply) => self.incoming.lock().unwrap().push_back(reply.into_bytes()),
                None if command.starts_with("AT") => {
                    self.incoming.lock().unwrap().push_back(b"OK\r\r>".to_vec())
                }
                None => {}
            }
            Ok(())
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn read_until(&mut self, _delimiter: u8) -> io::Result<Vec<u8>> {
            let next = self.incoming.lock().unwrap().pop_front();
            if let Some(chunk) = next {
                return Ok(chunk);
            }
            let error = *self.read_error.lock().unwrap();
            match error {
                Some(kind) => Err(io::Error::new(kind, "Mock read error")),
                None => std::future::pending().await,
            }
        }
    }

    /// Opener handing out clones of one mock port
    ///
    /// The first `failures` opens fail with a serial error.
    #[derive(Clone)]
    pub struct MockOpener {
        pub port: MockSerialPort,
        pub failures: Arc<AtomicU32>,
        pub opens: Arc<AtomicU32>,
    }

    impl MockOpener {
        pub fn new(port: MockSerialPort) -> Self {
            Self::failing(port, 0)
        }

        pub fn failing(port: MockSerialPort, failures: u32) -> Self {
            Self {
                port,
                failures: Arc::new(AtomicU32::new(failures)),
                opens: Arc::new(AtomicU32::new(0)),
            }
        }

        pub fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PortOpener for MockOpener {
        async fn open(&self, path: &str, _baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(CartelemError::Serial(format!("Failed to open {}: mock", path)));
            }
            Ok(Box::new(self.port.clone()))
        }
    }
}
