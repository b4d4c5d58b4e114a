//! # Distribution Bus
//!
//! Session-scoped publish/subscribe fan-out for live consumers.
//!
//! Every subscription owns a bounded outbound queue (a single-receiver
//! `broadcast` channel). The bus writes into it without waiting; when the
//! queue is full the oldest message is overwritten and the subscriber sees
//! the gap as lag. A slow subscriber therefore never stalls the others.
//!
//! The transport that drains subscriptions (WebSocket, SSE, ...) lives
//! outside this crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::BusConfig;
use crate::error::Result;
use crate::telemetry::{Envelope, SessionId};

/// WebSocket-style normal closure code
pub const NORMAL_CLOSURE: u16 = 1000;

/// Message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    TelemetryData {
        session_id: SessionId,
        envelope: Envelope,
    },
    Heartbeat {
        ts_wall: DateTime<Utc>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

impl BusMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

type Registry = HashMap<SessionId, HashMap<u64, broadcast::Sender<BusMessage>>>;

#[derive(Debug)]
struct BusInner {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    buffer: usize,
    heartbeat_interval: Duration,
    messages_sent: AtomicU64,
    closed: AtomicBool,
}

impl BusInner {
    fn remove(&self, session_id: SessionId, id: u64) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(connections) = registry.get_mut(&session_id) else {
            return false;
        };
        let removed = connections.remove(&id).is_some();
        if connections.is_empty() {
            registry.remove(&session_id);
        }
        removed
    }
}

/// Session-scoped broadcaster
///
/// Cheap to clone; all clones share one registry.
#[derive(Debug, Clone)]
pub struct DistributionBus {
    inner: Arc<BusInner>,
}

impl DistributionBus {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: config.subscriber_buffer.max(1),
                heartbeat_interval: config.heartbeat_interval(),
                messages_sent: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a new connection under `session_id`
    ///
    /// The connection is removed when the returned [`Subscription`] is
    /// dropped or closed. After [`Self::shutdown`] the subscription ends
    /// immediately.
    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = broadcast::channel(self.inner.buffer);

        // Checked under the lock so shutdown either sees this entry or we see `closed`
        let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        if self.inner.closed.load(Ordering::Acquire) {
            drop(tx);
        } else {
            registry.entry(session_id).or_default().insert(id, tx);
            info!("Subscriber {} joined session {}", id, session_id);
        }
        drop(registry);

        Subscription {
            id,
            session_id,
            rx,
            lagged: 0,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a connection whose transport reported an error
    pub fn disconnect(&self, session_id: SessionId, id: u64) {
        if self.inner.remove(session_id, id) {
            info!("Subscriber {} left session {}", id, session_id);
        }
    }

    /// Broadcast an envelope to its session's subscribers
    ///
    /// # Returns
    ///
    /// * `usize` - Number of connections the message was queued for
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let message = BusMessage::TelemetryData {
            session_id: envelope.session_id,
            envelope: envelope.clone(),
        };
        self.send_to_session(envelope.session_id, message)
    }

    /// Send a heartbeat to every connection of every session
    pub fn broadcast_heartbeat(&self) -> usize {
        let message = BusMessage::Heartbeat { ts_wall: Utc::now() };
        self.sessions_with_subscribers()
            .into_iter()
            .map(|session_id| self.send_to_session(session_id, message.clone()))
            .sum()
    }

    fn send_to_session(&self, session_id: SessionId, message: BusMessage) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            let Some(connections) = registry.get(&session_id) else {
                return 0;
            };
            for (id, tx) in connections {
                match tx.send(message.clone()) {
                    Ok(_) => delivered += 1,
                    Err(_) => dead.push(*id),
                }
            }
        }
        for id in dead {
            self.disconnect(session_id, id);
        }
        self.inner.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn connection_count(&self, session_id: SessionId) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(&session_id).map_or(0, HashMap::len)
    }

    pub fn total_connections(&self) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.values().map(HashMap::len).sum()
    }

    /// Sessions that currently have at least one subscriber
    pub fn sessions_with_subscribers(&self) -> Vec<SessionId> {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionId> = registry.keys().copied().collect();
        sessions.sort();
        sessions
    }

    /// Messages queued to subscribers since startup
    pub fn messages_sent(&self) -> u64 {
        self.inner.messages_sent.load(Ordering::Relaxed)
    }

    /// Emit heartbeats until cancelled
    pub async fn run_heartbeat(self, cancel: CancellationToken) {
        let period = self.inner.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let sent = self.broadcast_heartbeat();
                    debug!("Heartbeat sent to {} subscribers", sent);
                }
            }
        }
    }

    /// Send every connection a normal-closure message and release them
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let registry = std::mem::take(
            &mut *self.inner.registry.write().unwrap_or_else(PoisonError::into_inner),
        );
        let close = BusMessage::Close {
            code: NORMAL_CLOSURE,
            reason: "server shutdown".to_string(),
        };
        let mut closed = 0;
        for tx in registry.values().flat_map(HashMap::values) {
            if tx.send(close.clone()).is_ok() {
                closed += 1;
            }
        }
        info!("Distribution bus closed {} connections", closed);
    }
}

/// One live connection to the bus
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    session_id: SessionId,
    rx: broadcast::Receiver<BusMessage>,
    lagged: u64,
    bus: std::sync::Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Messages overwritten before this subscriber read them
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Next message, or `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.lagged += n;
                    debug!("Subscriber {} lagged by {} messages", self.id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next message if one is already queued
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.lagged += n,
                Err(_) => return None,
            }
        }
    }

    /// Leave the bus
    pub fn close(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.session_id, self.id);
        }
    }
}
