//! # Protocol Readers
//!
//! One reader per physical source. Each owns its serial connection, drives
//! a [`ReconnectMachine`](crate::serial::ReconnectMachine) and turns device
//! output into [`Envelope`](crate::telemetry::Envelope)s handed to the
//! [`Dispatcher`](crate::telemetry::Dispatcher).
//!
//! Readers never fail their caller. Their health is published through a
//! shared [`ReaderStatus`].

pub mod gps;
pub mod obd;

pub use gps::GpsReader;
pub use obd::ObdReader;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::serial::ConnectionState;

/// Live status of one reader, shared with whoever supervises it
#[derive(Debug)]
pub struct ReaderStatus {
    name: &'static str,
    state: Mutex<ConnectionState>,
    received: AtomicU64,
    parsed: AtomicU64,
    failed: AtomicU64,
    ignored: AtomicU64,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
    unsupported: Mutex<Vec<String>>,
}

/// Point-in-time copy of a [`ReaderStatus`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReaderReport {
    pub name: &'static str,
    pub state: ConnectionState,
    /// Sentences or replies read from the device
    pub received: u64,
    /// Successfully interpreted
    pub parsed: u64,
    /// Malformed or failed
    pub failed: u64,
    /// Well-formed but not of interest (unknown sentence kinds)
    pub ignored: u64,
    pub reconnects: u64,
    pub last_error: Option<String>,
    /// Channels excluded by discovery
    pub unsupported: Vec<String>,
}

impl ReaderStatus {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(ConnectionState::Connecting),
            received: AtomicU64::new(0),
            parsed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_error: Mutex::new(None),
            unsupported: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parsed(&self) {
        self.parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &dyn std::fmt::Display) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn set_unsupported(&self, channels: Vec<String>) {
        *self.unsupported.lock().unwrap_or_else(PoisonError::into_inner) = channels;
    }

    pub fn report(&self) -> ReaderReport {
        ReaderReport {
            name: self.name,
            state: self.state(),
            received: self.received.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            unsupported: self
                .unsupported
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Per-channel emission limiter
///
/// A channel may emit once per `1 / rate_hz`. Readings arriving sooner are
/// dropped, never queued.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_emit: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(rate_hz: f64) -> Self {
        let min_interval = if rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            Duration::ZERO
        };
        Self {
            min_interval,
            last_emit: HashMap::new(),
        }
    }

    /// Whether `channel` may emit at `now`; records the emission if so
    pub fn allow(&mut self, channel: &str, now: Instant) -> bool {
        match self.last_emit.get_mut(channel) {
            Some(last) if now.saturating_duration_since(*last) < self.min_interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                self.last_emit.insert(channel.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counters() {
        let status = ReaderStatus::new("gps");
        status.record_received();
        status.record_received();
        status.record_parsed();
        status.record_failed();
        status.record_reconnect();
        status.set_state(ConnectionState::Backoff);
        status.record_error(&"device unplugged");

        let report = status.report();
        assert_eq!(report.name, "gps");
        assert_eq!(report.received, 2);
        assert_eq!(report.parsed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.state, ConnectionState::Backoff);
        assert_eq!(report.last_error.as_deref(), Some("device unplugged"));
    }

    #[test]
    fn test_report_serializes_state_snake_case() {
        let status = ReaderStatus::new("obd");
        status.set_state(ConnectionState::StoppedWithError);
        let json = serde_json::to_value(status.report()).unwrap();
        assert_eq!(json["state"], "stopped_with_error");
    }

    #[test]
    fn test_rate_limiter_drops_excess() {
        let mut limiter = RateLimiter::new(1.0);
        let start = Instant::now();

        assert!(limiter.allow("latitude", start));
        assert!(!limiter.allow("latitude", start + Duration::from_millis(500)));
        assert!(limiter.allow("longitude", start + Duration::from_millis(500)));
        assert!(limiter.allow("latitude", start + Duration::from_millis(1000)));
        assert!(!limiter.allow("latitude", start + Duration::from_millis(1999)));
    }

    #[test]
    fn test_rate_limiter_counts_from_last_emission() {
        let mut limiter = RateLimiter::new(2.0);
        let start = Instant::now();
        let allowed = (0..20)
            .filter(|i| limiter.allow("hdop", start + Duration::from_millis(i * 100)))
            .count();
        // 0.0, 0.5, 1.0, 1.5 s
        assert_eq!(allowed, 4);
    }
}
