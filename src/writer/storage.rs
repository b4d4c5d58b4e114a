//! Storage insert contract used by the batching writer

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{CartelemError, Result};
use crate::telemetry::{Envelope, FrameSnapshot};

/// Durable sink for batches and frame snapshots
///
/// Implementations may be slow; the writer is their only caller and never
/// retries a failed insert.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_signals(&self, batch: &[Envelope]) -> Result<()>;

    async fn insert_frame(&self, frame: &FrameSnapshot) -> Result<()>;
}

/// In-memory storage for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStorage {
    batches: Mutex<Vec<Vec<Envelope>>>,
    frames: Mutex<Vec<FrameSnapshot>>,
    failing: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following insert fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Batches in insert order
    pub fn batches(&self) -> Vec<Vec<Envelope>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn frames(&self) -> Vec<FrameSnapshot> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn signal_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Vec::len)
            .sum()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CartelemError::StorageInsert("memory storage set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert_signals(&self, batch: &[Envelope]) -> Result<()> {
        self.check()?;
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.to_vec());
        Ok(())
    }

    async fn insert_frame(&self, frame: &FrameSnapshot) -> Result<()> {
        self.check()?;
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{FramePayload, SessionId, Source};

    #[tokio::test]
    async fn test_memory_storage_records_inserts() {
        let storage = MemoryStorage::new();
        let env = Envelope::numeric(SessionId(1), Source::Satnav, "hdop", 0.9, "", 0);

        storage.insert_signals(&[env.clone(), env]).await.unwrap();
        storage
            .insert_frame(&FrameSnapshot::new(SessionId(1), 0, FramePayload::Uplink(vec![1, 0])))
            .await
            .unwrap();

        assert_eq!(storage.batches().len(), 1);
        assert_eq!(storage.signal_count(), 2);
        assert_eq!(storage.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage_failing() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        let result = storage.insert_signals(&[]).await;
        assert!(matches!(result, Err(CartelemError::StorageInsert(_))));
        assert!(storage.batches().is_empty());
    }
}
