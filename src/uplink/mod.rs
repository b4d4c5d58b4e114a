//! # Uplink Publisher
//!
//! Periodically compresses the latest values of a session into one codec
//! frame and hands it to the radio.
//!
//! Fields are taken in a fixed priority order until the next one would
//! push the frame past the payload ceiling:
//!
//! 1. Position: latitude, longitude, altitude
//! 2. Critical: SPEED, RPM, THROTTLE_POS, ENGINE_LOAD, COOLANT_TEMP
//! 3. Secondary: FUEL_LEVEL, INTAKE_TEMP, GPS speed, heading, satellites,
//!    HDOP, MAF, TIMING_ADVANCE, FUEL_PRESSURE

pub mod radio;

pub use radio::{LoggingRadio, RadioTransport, SerialRadio};

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::DistributionBus;
use crate::codec::encoder::{encode_frame, scale_value};
use crate::codec::protocol::{fields_within, FieldType, UplinkField};
use crate::config::UplinkConfig;
use crate::error::Result;
use crate::telemetry::{
    Envelope, FramePayload, FrameSnapshot, LastKnownValueStore, MonotonicClock, SessionId, Source,
};
use crate::writer::WriterHandle;

/// Transmission priority, highest first
pub const PRIORITY: [UplinkField; 17] = [
    UplinkField::Latitude,
    UplinkField::Longitude,
    UplinkField::Altitude,
    UplinkField::Speed,
    UplinkField::Rpm,
    UplinkField::ThrottlePos,
    UplinkField::EngineLoad,
    UplinkField::CoolantTemp,
    UplinkField::FuelLevel,
    UplinkField::IntakeTemp,
    UplinkField::GpsSpeed,
    UplinkField::Heading,
    UplinkField::Satellites,
    UplinkField::Hdop,
    UplinkField::Maf,
    UplinkField::TimingAdvance,
    UplinkField::FuelPressure,
];

/// Channel announcing each transmitted frame on the bus
pub const FRAME_CHANNEL: &str = "frame_bytes";

fn source_of(field: UplinkField) -> Source {
    match field.field_type() {
        FieldType::Gps => Source::Satnav,
        _ => Source::Diagnostics,
    }
}

/// Outcome of field selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSelection {
    /// Fields to encode, in priority order
    pub fields: Vec<(UplinkField, f64)>,
    /// Fields skipped because their value does not fit the wire format
    pub out_of_range: Vec<UplinkField>,
}

/// Pick fields from a session snapshot under a byte ceiling
///
/// Only good numeric values are considered. A field that fails the codec
/// range check is skipped and does not use up space.
pub fn select_fields(snapshot: &[Envelope], ceiling: usize) -> FieldSelection {
    let budget = fields_within(ceiling);
    let mut selection = FieldSelection::default();

    for field in PRIORITY {
        if selection.fields.len() >= budget {
            break;
        }
        let source = source_of(field);
        let value = snapshot
            .iter()
            .find(|e| e.source == source && e.channel == field.name())
            .and_then(Envelope::good_numeric);
        let Some(value) = value else {
            continue;
        };
        match scale_value(field, value) {
            Ok(_) => selection.fields.push((field, value)),
            Err(e) => {
                warn!("Omitting {} from uplink: {}", field.name(), e);
                selection.out_of_range.push(field);
            }
        }
    }
    selection
}

/// Publisher counters
#[derive(Debug, Default)]
pub struct UplinkStats {
    frames_published: AtomicU64,
    bytes_transmitted: AtomicU64,
    transmission_errors: AtomicU64,
    encoding_errors: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UplinkStatistics {
    pub frames_published: u64,
    pub bytes_transmitted: u64,
    pub transmission_errors: u64,
    pub encoding_errors: u64,
}

impl UplinkStats {
    pub fn snapshot(&self) -> UplinkStatistics {
        UplinkStatistics {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            transmission_errors: self.transmission_errors.load(Ordering::Relaxed),
            encoding_errors: self.encoding_errors.load(Ordering::Relaxed),
        }
    }
}

pub struct UplinkPublisher {
    config: UplinkConfig,
    session_id: SessionId,
    store: Arc<LastKnownValueStore>,
    writer: WriterHandle,
    bus: DistributionBus,
    transport: Box<dyn RadioTransport>,
    stats: Arc<UplinkStats>,
    clock: MonotonicClock,
}

impl UplinkPublisher {
    pub fn new(
        config: UplinkConfig,
        session_id: SessionId,
        store: Arc<LastKnownValueStore>,
        writer: WriterHandle,
        bus: DistributionBus,
        transport: Box<dyn RadioTransport>,
    ) -> Self {
        Self {
            config,
            session_id,
            store,
            writer,
            bus,
            transport,
            stats: Arc::new(UplinkStats::default()),
            clock: MonotonicClock::new(),
        }
    }

    pub fn stats(&self) -> Arc<UplinkStats> {
        Arc::clone(&self.stats)
    }

    /// Build and send one frame
    ///
    /// # Returns
    ///
    /// * `Ok(Some(len))` - Frame of `len` bytes sent
    /// * `Ok(None)` - Nothing to send yet
    ///
    /// # Errors
    ///
    /// Returns the encoding or transport error; both are also counted.
    pub async fn publish_once(&mut self) -> Result<Option<usize>> {
        let snapshot = self.store.snapshot(self.session_id);
        let selection = select_fields(&snapshot, self.config.max_payload_size);
        self.stats
            .encoding_errors
            .fetch_add(selection.out_of_range.len() as u64, Ordering::Relaxed);

        if selection.fields.is_empty() {
            debug!("No values to uplink for session {}", self.session_id);
            return Ok(None);
        }

        let frame = match encode_frame(&selection.fields) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.encoding_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if let Err(e) = self.transport.send(&frame).await {
            self.stats.transmission_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let len = frame.len();
        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_transmitted.fetch_add(len as u64, Ordering::Relaxed);

        let ts = self.clock.now_ns();
        self.writer.enqueue_frame(FrameSnapshot::new(
            self.session_id,
            ts,
            FramePayload::Uplink(frame.to_vec()),
        ));
        self.bus.publish(&Envelope::numeric(
            self.session_id,
            Source::Uplink,
            FRAME_CHANNEL,
            len as f64,
            "bytes",
            ts,
        ));

        debug!("Uplinked {} fields in {} bytes", selection.fields.len(), len);
        Ok(Some(len))
    }

    /// Publish on the configured period until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.publish_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Uplink publisher started for session {} ({} Hz, {} byte ceiling)",
            self.session_id, self.config.publish_rate_hz, self.config.max_payload_size
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish_once().await {
                        warn!("Uplink publish failed: {}", e);
                    }
                }
            }
        }

        let stats = self.stats.snapshot();
        info!(
            "Uplink publisher stopped: {} frames, {} bytes, {} transmission errors",
            stats.frames_published, stats.bytes_transmitted, stats.transmission_errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::codec::decoder::decode_frame;
    use crate::codec::protocol::frame_size;
    use crate::config::{BusConfig, WriterConfig};
    use crate::error::CartelemError;
    use crate::writer::{BatchWriter, MemoryStorage};
    use radio::MockRadioTransport;
    use std::time::Duration;

    fn good(source: Source, channel: &str, value: f64) -> Envelope {
        Envelope::numeric(SessionId(1), source, channel, value, "", 0)
    }

    /// A snapshot carrying every uplink field
    fn full_snapshot() -> Vec<Envelope> {
        UplinkField::ALL
            .iter()
            .map(|f| good(source_of(*f), f.name(), 10.0))
            .collect()
    }

    #[test]
    fn test_select_default_ceiling_takes_ten_by_priority() {
        let selection = select_fields(&full_snapshot(), 64);
        let fields: Vec<UplinkField> = selection.fields.iter().map(|(f, _)| *f).collect();
        assert_eq!(fields, PRIORITY[..10].to_vec());
        assert!(frame_size(fields.len()) <= 64);
    }

    #[test]
    fn test_lower_ceiling_never_adds_fields() {
        let snapshot = full_snapshot();
        let at_64 = select_fields(&snapshot, 64).fields.len();
        let at_20 = select_fields(&snapshot, 20).fields.len();
        assert_eq!(at_20, 3);
        assert!(at_20 <= at_64);

        let mut last = usize::MAX;
        for ceiling in (0..=128).rev() {
            let n = select_fields(&snapshot, ceiling).fields.len();
            assert!(frame_size(n) <= ceiling.max(frame_size(0)));
            assert!(n <= last);
            last = n;
        }
    }

    #[test]
    fn test_missing_and_bad_quality_values_skipped() {
        let snapshot = vec![
            good(Source::Diagnostics, "RPM", 2000.0),
            Envelope::without_value(
                SessionId(1),
                Source::Satnav,
                "latitude",
                "deg",
                crate::telemetry::Quality::NoData,
                0,
            ),
            good(Source::Satnav, "speed_kph", 44.0),
        ];
        let selection = select_fields(&snapshot, 64);
        assert_eq!(
            selection.fields,
            vec![(UplinkField::Rpm, 2000.0), (UplinkField::GpsSpeed, 44.0)]
        );
    }

    #[test]
    fn test_source_must_match() {
        // An OBD channel named like a GPS field is not GPS data
        let snapshot = vec![good(Source::Diagnostics, "latitude", 12.0)];
        assert!(select_fields(&snapshot, 64).fields.is_empty());
    }

    #[test]
    fn test_out_of_range_field_omitted_without_using_space() {
        let snapshot = vec![
            good(Source::Satnav, "latitude", 400.0),
            good(Source::Satnav, "longitude", 11.5),
        ];
        let selection = select_fields(&snapshot, 8);
        assert_eq!(selection.fields, vec![(UplinkField::Longitude, 11.5)]);
        assert_eq!(selection.out_of_range, vec![UplinkField::Latitude]);
    }

    struct Harness {
        store: Arc<LastKnownValueStore>,
        bus: DistributionBus,
        writer: WriterHandle,
        _batch_writer: BatchWriter,
    }

    fn harness() -> Harness {
        let store = Arc::new(LastKnownValueStore::new());
        let (batch_writer, writer) = BatchWriter::new(
            &WriterConfig::default(),
            Arc::new(MemoryStorage::new()),
            store.clone(),
        );
        Harness {
            store,
            bus: DistributionBus::new(&BusConfig::default()),
            writer,
            _batch_writer: batch_writer,
        }
    }

    fn publisher(
        h: &Harness,
        config: UplinkConfig,
        transport: Box<dyn RadioTransport>,
    ) -> UplinkPublisher {
        UplinkPublisher::new(
            config,
            SessionId(1),
            h.store.clone(),
            h.writer.clone(),
            h.bus.clone(),
            transport,
        )
    }

    #[tokio::test]
    async fn test_publish_once_sends_decodable_frame() {
        let h = harness();
        h.store.update(&good(Source::Satnav, "latitude", 37.7749));
        h.store.update(&good(Source::Diagnostics, "RPM", 2500.0));
        let mut sub = h.bus.subscribe(SessionId(1));

        let mut mock = MockRadioTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|frame: &[u8]| {
                let fields = decode_frame(frame).unwrap();
                fields.len() == 2
                    && fields[0].0 == UplinkField::Latitude
                    && fields[1].0 == UplinkField::Rpm
            })
            .returning(|_| Ok(()));

        let mut publisher = publisher(&h, UplinkConfig::default(), Box::new(mock));
        let stats = publisher.stats();

        assert_eq!(publisher.publish_once().await.unwrap(), Some(frame_size(2)));
        assert_eq!(
            stats.snapshot(),
            UplinkStatistics {
                frames_published: 1,
                bytes_transmitted: 14,
                transmission_errors: 0,
                encoding_errors: 0,
            }
        );
        assert_eq!(h.writer.stats().queue_depth, 1);
        match sub.try_recv() {
            Some(BusMessage::TelemetryData { envelope, .. }) => {
                assert_eq!(envelope.source, Source::Uplink);
                assert_eq!(envelope.channel, FRAME_CHANNEL);
                assert_eq!(envelope.value_numeric, Some(14.0));
            }
            other => panic!("Expected uplink announcement, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ceiling_respected_by_sent_frame() {
        let h = harness();
        for env in full_snapshot() {
            h.store.update(&env);
        }
        let mut mock = MockRadioTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|frame: &[u8]| frame.len() <= 20)
            .returning(|_| Ok(()));

        let config = UplinkConfig {
            max_payload_size: 20,
            ..UplinkConfig::default()
        };
        let mut publisher = publisher(&h, config, Box::new(mock));
        assert_eq!(publisher.publish_once().await.unwrap(), Some(20));
    }

    #[tokio::test]
    async fn test_empty_store_sends_nothing() {
        let h = harness();
        let mut mock = MockRadioTransport::new();
        mock.expect_send().times(0);

        let mut publisher = publisher(&h, UplinkConfig::default(), Box::new(mock));
        assert_eq!(publisher.publish_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transport_error_counted_and_not_recorded() {
        let h = harness();
        h.store.update(&good(Source::Diagnostics, "SPEED", 30.0));
        let mut mock = MockRadioTransport::new();
        mock.expect_send()
            .returning(|_| Err(CartelemError::Transport("radio unplugged".to_string())));

        let mut publisher = publisher(&h, UplinkConfig::default(), Box::new(mock));
        let stats = publisher.stats();

        assert!(publisher.publish_once().await.is_err());
        assert_eq!(stats.snapshot().transmission_errors, 1);
        assert_eq!(stats.snapshot().frames_published, 0);
        assert_eq!(h.writer.stats().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_each_period_despite_errors() {
        let h = harness();
        h.store.update(&good(Source::Diagnostics, "RPM", 1000.0));

        let mut mock = MockRadioTransport::new();
        let mut calls = 0;
        mock.expect_send().returning(move |_| {
            calls += 1;
            if calls % 2 == 0 {
                Err(CartelemError::Transport("fade".to_string()))
            } else {
                Ok(())
            }
        });

        let publisher = publisher(&h, UplinkConfig::default(), Box::new(mock));
        let stats = publisher.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(publisher.run(cancel.clone()));

        // ticks at 0, 1, 2 and 3 s
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();
        task.await.unwrap();

        let s = stats.snapshot();
        assert_eq!(s.frames_published, 2);
        assert_eq!(s.transmission_errors, 2);
    }
}
