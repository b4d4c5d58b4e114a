//! # Diagnostics Reader
//!
//! Polls an ELM327-compatible OBD-II adapter.
//!
//! After every connect the adapter is initialised with the AT command
//! sequence. The first successful connection also runs discovery: each
//! configured PID is requested once and PIDs the vehicle does not answer
//! are excluded for the lifetime of the reader. Every supported PID then
//! gets its own poll task at its own rate, all sharing the one port.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ReaderStatus;
use crate::config::{ObdConfig, PidConfig, ReconnectConfig};
use crate::error::{CartelemError, Result};
use crate::obd::elm327::{parse_pid_response, PidResponse, ELM_PROMPT, INIT_COMMANDS};
use crate::serial::{ConnectionState, PortOpener, ReconnectMachine, SerialPortIO};
use crate::telemetry::{Dispatcher, Envelope, MonotonicClock, Quality, SessionId, Source};

type SharedPort = Arc<Mutex<Box<dyn SerialPortIO>>>;

/// Send one command and collect the reply up to the prompt
///
/// # Returns
///
/// * `Ok(Some(reply))` - Raw reply text
/// * `Ok(None)` - No prompt within `wait`
///
/// # Errors
///
/// Returns `Connection` on write or read failure
async fn query(
    port: &mut dyn SerialPortIO,
    command: &str,
    wait: Duration,
) -> Result<Option<String>> {
    let line = format!("{}\r", command);
    port.write_all(line.as_bytes())
        .await
        .map_err(|e| CartelemError::Connection(format!("Failed to send {}: {}", command, e)))?;
    port.flush().await.map_err(|e| {
        CartelemError::Connection(format!("Failed to flush after {}: {}", command, e))
    })?;

    match timeout(wait, port.read_until(ELM_PROMPT)).await {
        Ok(Ok(reply)) => Ok(Some(String::from_utf8_lossy(&reply).into_owned())),
        Ok(Err(e)) => Err(CartelemError::Connection(format!(
            "Read failed after {}: {}",
            command, e
        ))),
        Err(_) => Ok(None),
    }
}

pub struct ObdReader {
    config: ObdConfig,
    reconnect: ReconnectConfig,
    session_id: SessionId,
    opener: Arc<dyn PortOpener>,
    dispatcher: Dispatcher,
    status: Arc<ReaderStatus>,
    clock: MonotonicClock,
    /// Discovery result, kept across reconnects
    supported: Option<Vec<PidConfig>>,
}

impl ObdReader {
    pub fn new(
        config: ObdConfig,
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
            status: Arc::new(ReaderStatus::new("obd")),
            clock: MonotonicClock::new(),
            supported: None,
        }
    }

    pub fn status(&self) -> Arc<ReaderStatus> {
        Arc::clone(&self.status)
    }

    fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Poll until cancelled or until reconnect attempts are exhausted
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut machine = ReconnectMachine::new(&self.reconnect);
        info!(
            "OBD reader starting for session {} on {} ({} baud, {} PIDs)",
            self.session_id,
            self.config.port,
            self.config.baud_rate,
            self.config.pids.len()
        );

        loop {
            self.status.set_state(machine.state());

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.opener.open(&self.config.port, self.config.baud_rate) => result,
            };

            let failure = match opened {
                Ok(port) => {
                    machine.on_connected();
                    self.status.set_state(machine.state());
                    info!("OBD adapter connected on {}", self.config.port);
                    match self.serve(port, &mut machine, &cancel).await {
                        Some(err) => err,
                        None => break,
                    }
                }
                Err(e) => e,
            };

            warn!("OBD connection problem: {}", failure);
            self.status.record_error(&failure);

            match machine.on_failure() {
                Some(delay) => {
                    self.status.set_state(machine.state());
                    self.status.record_reconnect();
                    debug!(
                        "OBD reconnecting in {:?} (attempt {})",
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
                        "OBD reader giving up after {} consecutive failures",
                        machine.consecutive_failures()
                    );
                    return;
                }
            }
        }

        let report = self.status.report();
        info!(
            "OBD reader stopped. Stats: {} replies, {} decoded, {} failed",
            report.received, report.parsed, report.failed
        );
    }

    /// Drive one connection; `None` when cancelled
    async fn serve(
        &mut self,
        mut port: Box<dyn SerialPortIO>,
        machine: &mut ReconnectMachine,
        cancel: &CancellationToken,
    ) -> Option<CartelemError> {
        let setup = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.initialize(port.as_mut()) => result,
        };
        if let Err(e) = setup {
            return Some(e);
        }
        machine.on_read_success();

        let supported = match self.supported.clone() {
            Some(supported) => supported,
            None => {
                let discovered = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    result = self.discover(port.as_mut()) => result,
                };
                match discovered {
                    Ok(supported) => {
                        self.supported = Some(supported.clone());
                        supported
                    }
                    Err(e) => return Some(e),
                }
            }
        };

        if supported.is_empty() {
            warn!("No configured PID is supported by the vehicle, idling");
            cancel.cancelled().await;
            return None;
        }

        let port: SharedPort = Arc::new(Mutex::new(port));
        let mut pollers = JoinSet::new();
        for pid in supported {
            let poller = PidPoller {
                pid,
                port: Arc::clone(&port),
                dispatcher: self.dispatcher.clone(),
                status: Arc::clone(&self.status),
                session_id: self.session_id,
                clock: self.clock,
                reply_timeout: self.reply_timeout(),
            };
            pollers.spawn(poller.run());
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            Some(joined) = pollers.join_next() => Some(match joined {
                Ok(err) => err,
                Err(e) => CartelemError::Connection(format!("PID poller failed: {}", e)),
            }),
        };
        pollers.shutdown().await;
        outcome
    }

    async fn initialize(&self, port: &mut dyn SerialPortIO) -> Result<()> {
        for command in INIT_COMMANDS {
            match query(port, command, self.reply_timeout()).await? {
                Some(reply) => debug!("{} -> {:?}", command, reply.trim()),
                None => {
                    return Err(CartelemError::Connection(format!(
                        "Adapter did not answer {}",
                        command
                    )))
                }
            }
        }
        info!("ELM327 initialised");
        Ok(())
    }

    /// Request every configured PID once and keep those that answer
    async fn discover(&self, port: &mut dyn SerialPortIO) -> Result<Vec<PidConfig>> {
        let mut supported = Vec::new();
        let mut unsupported = Vec::new();

        for pid_config in &self.config.pids {
            let pid = pid_config.pid;
            let reply = query(port, &pid.request(), self.reply_timeout()).await?;
            self.status.record_received();

            let verdict = match reply {
                None => Err("timeout".to_string()),
                Some(raw) => match parse_pid_response(pid, &raw) {
                    Ok(PidResponse::Value(_)) => Ok(()),
                    Ok(PidResponse::Unsupported(reason)) => Err(reason),
                    Err(e) => Err(e.to_string()),
                },
            };

            match verdict {
                Ok(()) => supported.push(pid_config.clone()),
                Err(reason) => {
                    info!("{}", CartelemError::UnsupportedChannel(format!("{} ({})", pid, reason)));
                    unsupported.push(pid.name().to_string());
                }
            }
        }

        info!(
            "Discovery finished: {} supported, {} unsupported",
            supported.len(),
            unsupported.len()
        );
        self.status.set_unsupported(unsupported);
        Ok(supported)
    }
}

/// Poll loop for a single PID
struct PidPoller {
    pid: PidConfig,
    port: SharedPort,
    dispatcher: Dispatcher,
    status: Arc<ReaderStatus>,
    session_id: SessionId,
    clock: MonotonicClock,
    reply_timeout: Duration,
}

impl PidPoller {
    fn unit(&self) -> &str {
        if self.pid.unit.is_empty() {
            self.pid.pid.default_unit()
        } else {
            &self.pid.unit
        }
    }

    /// Runs until the connection fails and returns that failure
    async fn run(self) -> CartelemError {
        let request = self.pid.pid.request();
        let mut ticker = interval(self.pid.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            // Held through emit so the reader's timestamps reach the
            // dispatcher in order
            let mut port = self.port.lock().await;
            let raw = match query(&mut **port, &request, self.reply_timeout).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    return CartelemError::Connection(format!(
                        "No reply to {} within {:?}",
                        request, self.reply_timeout
                    ))
                }
                Err(e) => return e,
            };
            self.status.record_received();
            self.emit(&raw);
            drop(port);
        }
    }

    fn emit(&self, raw: &str) {
        let name = self.pid.pid.name();
        let ts = self.clock.now_ns();

        let unit = self.unit();
        let session = self.session_id;
        let source = Source::Diagnostics;

        let envelope = match parse_pid_response(self.pid.pid, raw) {
            Ok(PidResponse::Value(value)) => {
                self.status.record_parsed();
                Envelope::numeric(session, source, name, value, unit, ts)
            }
            Ok(PidResponse::Unsupported(reason)) => {
                self.status.record_failed();
                debug!("{} answered {}", name, reason);
                Envelope::without_value(session, source, name, unit, Quality::Error, ts)
            }
            Err(e) => {
                self.status.record_failed();
                warn!("{} response rejected: {}", name, e);
                Envelope::without_value(session, source, name, unit, Quality::Error, ts)
            }
        };
        self.dispatcher.dispatch(envelope);
    }
}
