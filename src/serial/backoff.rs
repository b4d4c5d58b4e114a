//! # Reconnect State Machine
//!
//! Pure bookkeeping for a device connection: which state it is in, how
//! many consecutive failures it has seen and how long to wait next. The
//! readers drive it and do the actual sleeping, so it can be tested
//! without I/O or timers.
//!
//! ```text
//! Connecting --open ok------------> Connected
//! Connecting --open failed--------> Backoff | StoppedWithError
//! Connected  --read ok------------> Connected (failures reset)
//! Connected  --I/O error/timeout--> Backoff | StoppedWithError
//! Backoff    --delay elapsed------> Connecting
//! ```

use serde::Serialize;
use std::time::Duration;

use crate::config::ReconnectConfig;

/// Connection state of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Backoff,
    /// Terminal: reconnect attempts exhausted
    StoppedWithError,
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ConnectionState,
    failures: u32,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ReconnectMachine {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self::with_limits(config.initial_delay(), config.max_delay(), config.max_attempts)
    }

    pub fn with_limits(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Connecting,
            failures: 0,
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ConnectionState::StoppedWithError
    }

    /// Wait after the `n`-th consecutive failure: `min(initial * 2^(n-1), max)`
    pub fn delay_for(&self, n: u32) -> Duration {
        let factor = 2u32.checked_pow(n.saturating_sub(1));
        factor
            .and_then(|f| self.initial_delay.checked_mul(f))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn on_connected(&mut self) {
        if !self.is_stopped() {
            self.state = ConnectionState::Connected;
        }
    }

    /// A full read cycle succeeded; the next failure waits the initial delay
    pub fn on_read_success(&mut self) {
        if self.state == ConnectionState::Connected {
            self.failures = 0;
        }
    }

    /// Record an open or I/O failure
    ///
    /// # Returns
    ///
    /// * `Some(delay)` - Wait this long, then call [`Self::on_backoff_elapsed`]
    /// * `None` - Attempts exhausted, the machine is now `StoppedWithError`
    pub fn on_failure(&mut self) -> Option<Duration> {
        if self.is_stopped() {
            return None;
        }
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_attempts {
            self.state = ConnectionState::StoppedWithError;
            return None;
        }
        self.state = ConnectionState::Backoff;
        Some(self.delay_for(self.failures))
    }

    pub fn on_backoff_elapsed(&mut self) {
        if self.state == ConnectionState::Backoff {
            self.state = ConnectionState::Connecting;
        }
    }
}
