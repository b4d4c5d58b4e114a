//! # Satellite-Navigation Reader
//!
//! Reads NMEA 0183 lines from a GPS receiver and emits one envelope per
//! channel per sentence, rate-limited per channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RateLimiter, ReaderStatus};
use crate::config::{GpsConfig, ReconnectConfig};
use crate::error::CartelemError;
use crate::nmea::parser::{parse_sentence, FieldValue, ParsedSentence};
use crate::serial::{ConnectionState, PortOpener, ReconnectMachine, SerialPortIO};
use crate::telemetry::{Dispatcher, Envelope, MonotonicClock, Quality, SessionId, Source};

pub struct GpsReader {
    config: GpsConfig,
    reconnect: ReconnectConfig,
    session_id: SessionId,
    opener: Arc<dyn PortOpener>,
    dispatcher: Dispatcher,
    status: Arc<ReaderStatus>,
    clock: MonotonicClock,
}

impl GpsReader {
    pub fn new(
        config: GpsConfig,
        reconnect: ReconnectConfig,
        session_id: SessionId,
        opener: Arc<dyn PortOpener>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            config,
            reconnect,
            session_id,
            opener,
            dispatcher,
            status: Arc::new(ReaderStatus::new("gps")),
            clock: MonotonicClock::new(),
        }
    }

    pub fn status(&self) -> Arc<ReaderStatus> {
        Arc::clone(&self.status)
    }

    /// Read until cancelled or until reconnect attempts are exhausted
    pub async fn run(self, cancel: CancellationToken) {
        let mut machine = ReconnectMachine::new(&self.reconnect);
        let mut limiter = RateLimiter::new(self.config.rate_hz);
        info!(
            "GPS reader starting for session {} on {} ({} baud)",
            self.session_id, self.config.port, self.config.baud_rate
        );

        loop {
            self.status.set_state(machine.state());

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.opener.open(&self.config.port, self.config.baud_rate) => result,
            };

            let failure = match opened {
                Ok(mut port) => {
                    machine.on_connected();
                    self.status.set_state(machine.state());
                    info!("GPS connected on {}", self.config.port);
                    let outcome = self
                        .read_lines(port.as_mut(), &mut machine, &mut limiter, &cancel)
                        .await;
                    match outcome {
                        Some(err) => err,
                        None => break,
                    }
                }
                Err(e) => e,
            };

            warn!("GPS connection problem: {}", failure);
            self.status.record_error(&failure);

            match machine.on_failure() {
                Some(delay) => {
                    self.status.set_state(machine.state());
                    self.status.record_reconnect();
                    debug!(
                        "GPS reconnecting in {:?} (attempt {})",
                        delay,
                        machine.consecutive_failures()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                    machine.on_backoff_elapsed();
                }
                None => {
                    self.status.set_state(ConnectionState::StoppedWithError);
                    error!(
                        "GPS reader giving up after {} consecutive failures",
                        machine.consecutive_failures()
                    );
                    return;
                }
            }
        }

        let report = self.status.report();
        info!(
            "GPS reader stopped. Stats: {} received, {} parsed, {} failed",
            report.received, report.parsed, report.failed
        );
    }

    /// Returns the error that ended the connection, or `None` when cancelled
    async fn read_lines(
        &self,
        port: &mut dyn SerialPortIO,
        machine: &mut ReconnectMachine,
        limiter: &mut RateLimiter,
        cancel: &CancellationToken,
    ) -> Option<CartelemError> {
        let read_timeout = Duration::from_millis(self.config.timeout_ms);

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = timeout(read_timeout, port.read_until(b'\n')) => result,
            };

            let bytes = match read {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    return Some(CartelemError::Connection(format!("GPS read failed: {}", e)));
                }
                Err(_) => {
                    return Some(CartelemError::Connection(format!(
                        "No GPS data within {:?}",
                        read_timeout
                    )));
                }
            };

            machine.on_read_success();
            self.handle_line(&bytes, limiter);
        }
    }

    fn handle_line(&self, bytes: &[u8], limiter: &mut RateLimiter) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim();
        if !line.starts_with('$') {
            return;
        }
        self.status.record_received();

        match parse_sentence(line) {
            Ok(Some(parsed)) => {
                self.status.record_parsed();
                self.emit(&parsed, limiter);
            }
            Ok(None) => {
                self.status.record_ignored();
                debug!("Ignoring sentence: {}", line);
            }
            Err(e) => {
                self.status.record_failed();
                debug!("Discarding sentence: {}", e);
            }
        }
    }

    fn emit(&self, parsed: &ParsedSentence, limiter: &mut RateLimiter) {
        let now = Instant::now();
        for reading in &parsed.readings {
            if !limiter.allow(reading.channel, now) {
                continue;
            }
            let ts = self.clock.now_ns();
            let envelope = match &reading.value {
                FieldValue::Value(v) => Envelope::numeric(
                    self.session_id,
                    Source::Satnav,
                    reading.channel,
                    *v,
                    reading.unit,
                    ts,
                ),
                FieldValue::Empty => Envelope::without_value(
                    self.session_id,
                    Source::Satnav,
                    reading.channel,
                    reading.unit,
                    Quality::NoData,
                    ts,
                ),
                FieldValue::Invalid(reason) => {
                    debug!("{} {}: {}", parsed.kind.code(), reading.channel, reason);
                    Envelope::without_value(
                        self.session_id,
                        Source::Satnav,
                        reading.channel,
                        reading.unit,
                        Quality::Error,
                        ts,
                    )
                }
            };
            self.dispatcher.dispatch(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, DistributionBus};
    use crate::config::{BusConfig, WriterConfig};
    use crate::nmea::checksum::with_checksum;
    use crate::serial::port_trait::mocks::{MockOpener, MockSerialPort};
    use crate::telemetry::LastKnownValueStore;
    use crate::writer::{BatchWriter, MemoryStorage};
    use std::io;

    const GGA: &str = "GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";
    const RMC: &str = "GPRMC,225446,A,3746.494,S,12225.164,W,10.0,054.7,191194,020.3,E";

    struct Harness {
        store: Arc<LastKnownValueStore>,
        bus: DistributionBus,
        dispatcher: Dispatcher,
    }

    fn harness() -> Harness {
        let store = Arc::new(LastKnownValueStore::new());
        let bus = DistributionBus::new(&BusConfig::default());
        let (_writer, handle) = BatchWriter::new(
            &WriterConfig::default(),
            Arc::new(MemoryStorage::new()),
            store.clone(),
        );
        let dispatcher = Dispatcher::new(store.clone(), bus.clone(), handle);
        Harness { store, bus, dispatcher }
    }

    fn reader(opener: MockOpener, dispatcher: Dispatcher, reconnect: ReconnectConfig) -> GpsReader {
        GpsReader::new(GpsConfig::default(), reconnect, SessionId(1), Arc::new(opener), dispatcher)
    }

    fn line(body: &str) -> String {
        format!("{}\r\n", with_checksum(body))
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_position_from_gga() {
        let h = harness();
        let port = MockSerialPort::new();
        port.push_line(&line(GGA));
        let reader =
            reader(MockOpener::new(port), h.dispatcher.clone(), ReconnectConfig::default());
        let status = reader.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lat = h.store.get(SessionId(1), Source::Satnav, "latitude").unwrap();
        assert!((lat.value_numeric.unwrap() - 48.1173).abs() < 1e-9);
        assert_eq!(lat.unit, "deg");
        let sats = h.store.get(SessionId(1), Source::Satnav, "satellites").unwrap();
        assert_eq!(sats.value_numeric, Some(8.0));

        let report = status.report();
        assert_eq!(report.received, 1);
        assert_eq!(report.parsed, 1);
        assert_eq!(report.state, ConnectionState::Connected);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_southern_western_rmc() {
        let h = harness();
        let port = MockSerialPort::new();
        port.push_line(&line(RMC));
        let reader =
            reader(MockOpener::new(port), h.dispatcher.clone(), ReconnectConfig::default());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let lat = h.store.get(SessionId(1), Source::Satnav, "latitude").unwrap();
        let lon = h.store.get(SessionId(1), Source::Satnav, "longitude").unwrap();
        assert!((lat.value_numeric.unwrap() + 37.7749).abs() < 1e-9);
        assert!((lon.value_numeric.unwrap() + 122.4194).abs() < 1e-9);
        let speed = h.store.get(SessionId(1), Source::Satnav, "speed_kph").unwrap();
        assert!((speed.value_numeric.unwrap() - 18.52).abs() < 1e-9);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_per_channel() {
        let h = harness();
        let mut sub = h.bus.subscribe(SessionId(1));
        let port = MockSerialPort::new();
        port.push_line(&line(GGA));
        port.push_line(&line(GGA));
        let reader =
            reader(MockOpener::new(port), h.dispatcher.clone(), ReconnectConfig::default());
        let status = reader.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut latitude_count = 0;
        while let Some(msg) = sub.try_recv() {
            if let BusMessage::TelemetryData { envelope, .. } = msg {
                if envelope.channel == "latitude" {
                    latitude_count += 1;
                }
            }
        }
        assert_eq!(latitude_count, 1);
        assert_eq!(status.report().parsed, 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_checksum_and_unknown_sentences_counted() {
        let h = harness();
        let port = MockSerialPort::new();
        port.push_line("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00\r\n");
        port.push_line(&line("GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1"));
        port.push_line("garbage without a dollar\r\n");
        let reader =
            reader(MockOpener::new(port), h.dispatcher.clone(), ReconnectConfig::default());
        let status = reader.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let report = status.report();
        assert_eq!(report.received, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.ignored, 1);
        assert!(h.store.is_empty(SessionId(1)));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_field_marks_channel_error() {
        let h = harness();
        let port = MockSerialPort::new();
        port.push_line(&line("GPGGA,123519,4807.038,N,01131.000,E,1,08,abc,,M,46.9,M,,"));
        let reader =
            reader(MockOpener::new(port), h.dispatcher.clone(), ReconnectConfig::default());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let hdop = h.store.get(SessionId(1), Source::Satnav, "hdop").unwrap();
        assert_eq!(hdop.quality, Quality::Error);
        let alt = h.store.get(SessionId(1), Source::Satnav, "altitude").unwrap();
        assert_eq!(alt.quality, Quality::NoData);
        let lat = h.store.get(SessionId(1), Source::Satnav, "latitude").unwrap();
        assert_eq!(lat.quality, Quality::Good);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_triggers_reconnect() {
        let h = harness();
        let port = MockSerialPort::new();
        port.push_line(&line(GGA));
        port.set_read_error(io::ErrorKind::BrokenPipe);
        let opener = MockOpener::new(port);
        let reader = reader(opener.clone(), h.dispatcher.clone(), ReconnectConfig::default());
        let status = reader.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(opener.open_count() >= 2);
        let report = status.report();
        assert!(report.reconnects >= 1);
        assert!(report.last_error.unwrap().contains("GPS read failed"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let h = harness();
        let opener = MockOpener::failing(MockSerialPort::new(), u32::MAX);
        let reconnect = ReconnectConfig {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            max_attempts: 3,
        };
        let reader = reader(opener.clone(), h.dispatcher.clone(), reconnect);
        let status = reader.status();

        // Completes on its own, without cancellation
        reader.run(CancellationToken::new()).await;

        assert_eq!(opener.open_count(), 4);
        let report = status.report();
        assert_eq!(report.state, ConnectionState::StoppedWithError);
        assert_eq!(report.reconnects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let h = harness();
        let opener = MockOpener::new(MockSerialPort::new());
        let reader = reader(opener.clone(), h.dispatcher.clone(), ReconnectConfig::default());
        let status = reader.status();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reader.run(cancel.clone()));
        // 3 s read timeout, then 1 s backoff
        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert_eq!(opener.open_count(), 2);
        assert!(status.report().last_error.unwrap().contains("No GPS data"));

        cancel.cancel();
        task.await.unwrap();
    }
}
