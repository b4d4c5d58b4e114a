//! Radio transports for uplink frames

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CartelemError, Result};
use crate::serial::{PortOpener, SerialPortIO};
use crate::telemetry::envelope::to_hex;

/// Sink for encoded uplink frames
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioTransport: Send {
    async fn send(&mut self, frame: &[u8]) -> Result<()>;
}

/// Writes frames to a serial-attached radio
///
/// The port is opened on first use and reopened on the next send after
/// any failure.
pub struct SerialRadio {
    opener: Arc<dyn PortOpener>,
    device_path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPortIO>>,
}

impl SerialRadio {
    pub fn new(
        opener: Arc<dyn PortOpener>,
        device_path: impl Into<String>,
        baud_rate: u32,
    ) -> Self {
        Self {
            opener,
            device_path: device_path.into(),
            baud_rate,
            port: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[async_trait]
impl RadioTransport for SerialRadio {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if self.port.is_none() {
            let port = self
                .opener
                .open(&self.device_path, self.baud_rate)
                .await
                .map_err(|e| CartelemError::Transport(e.to_string()))?;
            info!("Uplink radio opened on {}", self.device_path);
            self.port = Some(port);
        }

        let Some(port) = self.port.as_mut() else {
            return Err(CartelemError::Transport("radio port unavailable".to_string()));
        };

        let written = match port.write_all(frame).await {
            Ok(()) => port.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            warn!("Uplink radio write failed, will reopen: {}", e);
            self.port = None;
            return Err(CartelemError::Transport(format!(
                "write to {} failed: {}",
                self.device_path, e
            )));
        }

        debug!("Sent uplink frame ({} bytes)", frame.len());
        Ok(())
    }
}

/// Transport used when no radio is configured: logs each frame
#[derive(Debug, Default)]
pub struct LoggingRadio {
    frames: u64,
}

impl LoggingRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_logged(&self) -> u64 {
        self.frames
    }
}

#[async_trait]
impl RadioTransport for LoggingRadio {
    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.frames += 1;
        debug!("Uplink frame #{} ({} bytes): {}", self.frames, frame.len(), to_hex(frame));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::port_trait::mocks::{MockOpener, MockSerialPort};
    use std::io;

    #[tokio::test]
    async fn test_serial_radio_opens_lazily_and_writes() {
        let port = MockSerialPort::new();
        let opener = MockOpener::new(port.clone());
        let mut radio = SerialRadio::new(Arc::new(opener.clone()), "/dev/ttyACM0", 38400);

        assert!(!radio.is_open());
        assert_eq!(opener.open_count(), 0);

        radio.send(&[0x01, 0x00]).await.unwrap();
        radio.send(&[0x01, 0x00]).await.unwrap();

        assert_eq!(opener.open_count(), 1);
        assert_eq!(port.get_written_data(), vec![vec![0x01, 0x00], vec![0x01, 0x00]]);
    }

    #[tokio::test]
    async fn test_serial_radio_reopens_after_write_failure() {
        let port = MockSerialPort::new();
        let opener = MockOpener::new(port.clone());
        let mut radio = SerialRadio::new(Arc::new(opener.clone()), "/dev/ttyACM0", 38400);

        port.set_write_error(io::ErrorKind::BrokenPipe);
        let result = radio.send(&[0x01, 0x00]).await;
        assert!(matches!(result, Err(CartelemError::Transport(_))));
        assert!(!radio.is_open());

        *port.write_error.lock().unwrap() = None;
        radio.send(&[0x01, 0x00]).await.unwrap();
        assert_eq!(opener.open_count(), 2);
    }

    #[tokio::test]
    async fn test_serial_radio_open_failure_is_transport_error() {
        let opener = MockOpener::failing(MockSerialPort::new(), 1);
        let mut radio = SerialRadio::new(Arc::new(opener.clone()), "/dev/ttyACM9", 38400);

        assert!(matches!(radio.send(&[1, 0]).await, Err(CartelemError::Transport(_))));
        assert!(radio.send(&[1, 0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_logging_radio_counts_frames() {
        let mut radio = LoggingRadio::new();
        radio.send(&[0x01, 0x00]).await.unwrap();
        assert_eq!(radio.frames_logged(), 1);
    }
}
