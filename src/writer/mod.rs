//! # Batching Persistence Writer
//!
//! Single consumer of a bounded queue fed by the dispatcher (signals) and
//! the uplink publisher (frame snapshots).
//!
//! This module handles:
//! - Non-blocking enqueue with drop-newest on overflow
//! - Batching signals by size or by age of the oldest buffered entry
//! - Periodic state snapshots of every active session
//! - Draining the queue on stop
//! - Throughput statistics

pub mod jsonl;
pub mod storage;

pub use jsonl::JsonlStorage;
pub use storage::{MemoryStorage, Storage};

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WriterConfig;
use crate::error::CartelemError;
use crate::telemetry::{
    Envelope, FramePayload, FrameSnapshot, LastKnownValueStore, MonotonicClock, SessionId,
};

/// Signals per minute the writer is expected to sustain
pub const THROUGHPUT_TARGET_PER_MIN: f64 = 5000.0;

/// Queue entry
#[derive(Debug, Clone)]
pub enum WriterItem {
    Signal(Envelope),
    Frame(FrameSnapshot),
}

/// State shared between the writer task and its handles
#[derive(Debug)]
struct WriterShared {
    sessions: RwLock<BTreeSet<SessionId>>,
    started: Instant,
    signals_processed: AtomicU64,
    batches_written: AtomicU64,
    frames_written: AtomicU64,
    queue_drops: AtomicU64,
    insert_failures: AtomicU64,
    current_batch: AtomicUsize,
}

impl WriterShared {
    fn statistics(&self, queue_depth: usize) -> WriterStatistics {
        let signals_processed = self.signals_processed.load(Ordering::Relaxed);
        let runtime_secs = self.started.elapsed().as_secs_f64();
        let signals_per_minute = if runtime_secs > 0.0 {
            signals_processed as f64 * 60.0 / runtime_secs
        } else {
            0.0
        };

        WriterStatistics {
            signals_processed,
            batches_written: self.batches_written.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            insert_failures: self.insert_failures.load(Ordering::Relaxed),
            current_batch_size: self.current_batch.load(Ordering::Relaxed),
            queue_depth,
            runtime_secs,
            signals_per_minute,
            throughput_achieved: signals_per_minute >= THROUGHPUT_TARGET_PER_MIN,
        }
    }
}

/// Writer counters at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriterStatistics {
    pub signals_processed: u64,
    pub batches_written: u64,
    pub frames_written: u64,
    pub queue_drops: u64,
    pub insert_failures: u64,
    pub current_batch_size: usize,
    pub queue_depth: usize,
    pub runtime_secs: f64,
    pub signals_per_minute: f64,
    pub throughput_achieved: bool,
}

/// Producer side of the writer queue
///
/// Cheap to clone. Never blocks.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterItem>,
    shared: Arc<WriterShared>,
}

impl WriterHandle {
    /// Queue a signal; `false` if it was dropped
    pub fn enqueue_signal(&self, envelope: Envelope) -> bool {
        self.enqueue(WriterItem::Signal(envelope))
    }

    /// Queue a frame snapshot; `false` if it was dropped
    pub fn enqueue_frame(&self, frame: FrameSnapshot) -> bool {
        self.enqueue(WriterItem::Frame(frame))
    }

    fn enqueue(&self, item: WriterItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.shared.queue_drops.fetch_add(1, Ordering::Relaxed) + 1;
                // Log the first drop and then every power of two
                if dropped.is_power_of_two() {
                    warn!("{}", CartelemError::QueueOverflow { dropped });
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Writer stopped, entry discarded");
                false
            }
        }
    }

    /// Enable periodic state snapshots for a session
    pub fn activate_session(&self, session_id: SessionId) {
        self.shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
    }

    pub fn deactivate_session(&self, session_id: SessionId) {
        self.shared
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn queue_drops(&self) -> u64 {
        self.shared.queue_drops.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> WriterStatistics {
        self.shared.statistics(self.tx.max_capacity() - self.tx.capacity())
    }
}

/// Consumer side of the writer queue
pub struct BatchWriter {
    rx: mpsc::Receiver<WriterItem>,
    shared: Arc<WriterShared>,
    storage: Arc<dyn Storage>,
    store: Arc<LastKnownValueStore>,
    batch: Vec<Envelope>,
    batch_size: usize,
    batch_timeout: Duration,
    batch_deadline: Option<Instant>,
    frame_interval: Duration,
    clock: MonotonicClock,
}

impl BatchWriter {
    /// Create the writer and its producer handle
    ///
    /// # Arguments
    ///
    /// * `config` - Batch and queue limits
    /// * `storage` - Insert target
    /// * `store` - Source of periodic state snapshots
    pub fn new(
        config: &WriterConfig,
        storage: Arc<dyn Storage>,
        store: Arc<LastKnownValueStore>,
    ) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::channel(config.max_queue_size.max(1));
        let shared = Arc::new(WriterShared {
            sessions: RwLock::new(BTreeSet::new()),
            started: Instant::now(),
            signals_processed: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            insert_failures: AtomicU64::new(0),
            current_batch: AtomicUsize::new(0),
        });

        let writer = Self {
            rx,
            shared: Arc::clone(&shared),
            storage,
            store,
            batch: Vec::with_capacity(config.batch_size),
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
            batch_deadline: None,
            frame_interval: config.frame_interval(),
            clock: MonotonicClock::new(),
        };
        (writer, WriterHandle { tx, shared })
    }

    /// Consume the queue until cancelled, then drain and flush
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Writer started (batch {} / {:?}, frames every {:?})",
            self.batch_size, self.batch_timeout, self.frame_interval
        );

        let mut frame_ticker =
            interval_at(Instant::now() + self.frame_interval, self.frame_interval);
        frame_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.batch_deadline;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }

                _ = frame_ticker.tick() => self.write_state_frames().await,

                item = self.rx.recv() => match item {
                    Some(item) => self.accept(item).await,
                    None => break,
                },
            }
        }

        self.rx.close();
        let mut drained = 0usize;
        while let Ok(item) = self.rx.try_recv() {
            self.accept(item).await;
            drained += 1;
        }
        self.flush().await;

        let stats = self.shared.statistics(0);
        info!(
            "Writer stopped: {} signals, {} batches, {} frames, {} dropped ({} drained at stop)",
            stats.signals_processed,
            stats.batches_written,
            stats.frames_written,
            stats.queue_drops,
            drained
        );
    }

    async fn accept(&mut self, item: WriterItem) {
        match item {
            WriterItem::Signal(envelope) => {
                if self.batch.is_empty() {
                    self.batch_deadline = Some(Instant::now() + self.batch_timeout);
                }
                self.batch.push(envelope);
                self.shared.signals_processed.fetch_add(1, Ordering::Relaxed);
                self.shared.current_batch.store(self.batch.len(), Ordering::Relaxed);
                if self.batch.len() >= self.batch_size {
                    self.flush().await;
                }
            }
            WriterItem::Frame(frame) => self.write_frame(&frame).await,
        }
    }

    async fn flush(&mut self) {
        self.batch_deadline = None;
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.shared.current_batch.store(0, Ordering::Relaxed);

        match self.storage.insert_signals(&batch).await {
            Ok(()) => {
                self.shared.batches_written.fetch_add(1, Ordering::Relaxed);
                debug!("Flushed batch of {} signals", batch.len());
            }
            Err(e) => {
                self.shared.insert_failures.fetch_add(1, Ordering::Relaxed);
                error!("Discarding batch of {} signals: {}", batch.len(), e);
            }
        }
    }

    async fn write_frame(&self, frame: &FrameSnapshot) {
        match self.storage.insert_frame(frame).await {
            Ok(()) => {
                self.shared.frames_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared.insert_failures.fetch_add(1, Ordering::Relaxed);
                error!("Discarding frame for session {}: {}", frame.session_id, e);
            }
        }
    }

    async fn write_state_frames(&self) {
        let sessions: Vec<SessionId> = self
            .shared
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();

        for session_id in sessions {
            let snapshot = self.store.snapshot(session_id);
            if snapshot.is_empty() {
                continue;
            }
            let frame =
                FrameSnapshot::new(session_id, self.clock.now_ns(), FramePayload::State(snapshot));
            self.write_frame(&frame).await;
        }
    }
}
