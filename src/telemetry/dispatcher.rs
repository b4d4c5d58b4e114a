//! Fan-out of freshly produced envelopes to the three sinks

use std::sync::Arc;

use super::envelope::Envelope;
use super::store::LastKnownValueStore;
use crate::bus::DistributionBus;
use crate::writer::WriterHandle;

/// Hands every envelope to the store, the bus and the writer
///
/// None of the sinks can block the caller: the store takes a short write
/// lock, the bus never waits on subscribers and the writer drops on
/// overflow.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<LastKnownValueStore>,
    bus: DistributionBus,
    writer: WriterHandle,
}

impl Dispatcher {
    pub fn new(
        store: Arc<LastKnownValueStore>,
        bus: DistributionBus,
        writer: WriterHandle,
    ) -> Self {
        Self { store, bus, writer }
    }

    pub fn dispatch(&self, envelope: Envelope) {
        self.store.update(&envelope);
        self.bus.publish(&envelope);
        self.writer.enqueue_signal(envelope);
    }

    pub fn store(&self) -> &Arc<LastKnownValueStore> {
        &self.store
    }

    pub fn bus(&self) -> &DistributionBus {
        &self.bus
    }

    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusMessage;
    use crate::config::{BusConfig, WriterConfig};
    use crate::telemetry::{SessionId, Source};
    use crate::writer::{BatchWriter, MemoryStorage};

    #[tokio::test]
    async fn test_dispatch_reaches_all_sinks() {
        let store = Arc::new(LastKnownValueStore::new());
        let bus = DistributionBus::new(&BusConfig::default());
        let (_writer, handle) = BatchWriter::new(
            &WriterConfig::default(),
            Arc::new(MemoryStorage::new()),
            store.clone(),
        );
        let dispatcher = Dispatcher::new(store.clone(), bus.clone(), handle.clone());
        let mut sub = bus.subscribe(SessionId(5));

        dispatcher.dispatch(Envelope::numeric(
            SessionId(5),
            Source::Diagnostics,
            "SPEED",
            42.0,
            "kph",
            1,
        ));

        let stored = store.get(SessionId(5), Source::Diagnostics, "SPEED").unwrap();
        assert_eq!(stored.value_numeric, Some(42.0));
        assert!(matches!(sub.try_recv(), Some(BusMessage::TelemetryData { .. })));
        assert_eq!(handle.stats().queue_depth, 1);
    }
}
