//! # Session Runtime
//!
//! Follows the session lifecycle owned by an external session manager.
//! Starting a session spawns its readers and uplink publisher under a
//! child cancellation token; stopping it cancels and awaits them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::DistributionBus;
use crate::config::Config;
use crate::error::{CartelemError, Result};
use crate::readers::{GpsReader, ObdReader, ReaderReport, ReaderStatus};
use crate::serial::PortOpener;
use crate::telemetry::{Dispatcher, LastKnownValueStore, SessionId};
use crate::uplink::{
    LoggingRadio, RadioTransport, SerialRadio, UplinkPublisher, UplinkStatistics, UplinkStats,
};
use crate::writer::WriterHandle;

/// Tasks and status handles belonging to one active session
struct ActiveSession {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    readers: Vec<Arc<ReaderStatus>>,
    uplink: Option<Arc<UplinkStats>>,
}

pub struct SessionRuntime {
    config: Arc<Config>,
    opener: Arc<dyn PortOpener>,
    store: Arc<LastKnownValueStore>,
    bus: DistributionBus,
    writer: WriterHandle,
    root: CancellationToken,
    sessions: Mutex<HashMap<SessionId, ActiveSession>>,
}

impl SessionRuntime {
    pub fn new(
        config: Arc<Config>,
        opener: Arc<dyn PortOpener>,
        store: Arc<LastKnownValueStore>,
        bus: DistributionBus,
        writer: WriterHandle,
    ) -> Self {
        Self {
            config,
            opener,
            store,
            bus,
            writer,
            root: CancellationToken::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the enabled readers and the uplink publisher for a session
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CartelemError::Session` if the session is already active.
    pub fn start(&self, session_id: SessionId) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session_id) {
            return Err(CartelemError::Session(format!("session {} is already active", session_id)));
        }

        let cancel = self.root.child_token();
        let dispatcher =
            Dispatcher::new(Arc::clone(&self.store), self.bus.clone(), self.writer.clone());
        let mut tasks = Vec::new();
        let mut readers = Vec::new();

        if self.config.gps.enabled {
            let reader = GpsReader::new(
                self.config.gps.clone(),
                self.config.reconnect.clone(),
                session_id,
                Arc::clone(&self.opener),
                dispatcher.clone(),
            );
            readers.push(reader.status());
            tasks.push(("gps", tokio::spawn(reader.run(cancel.clone()))));
        }

        if self.config.obd.enabled {
            let reader = ObdReader::new(
                self.config.obd.clone(),
                self.config.reconnect.clone(),
                session_id,
                Arc::clone(&self.opener),
                dispatcher,
            );
            readers.push(reader.status());
            tasks.push(("obd", tokio::spawn(reader.run(cancel.clone()))));
        }

        let mut uplink = None;
        if self.config.uplink.enabled {
            let transport: Box<dyn RadioTransport> = match &self.config.uplink.device_path {
                Some(path) => Box::new(SerialRadio::new(
                    Arc::clone(&self.opener),
                    path.clone(),
                    self.config.uplink.baud_rate,
                )),
                None => {
                    info!("No uplink radio configured, frames will only be logged");
                    Box::new(LoggingRadio::new())
                }
            };
            let publisher = UplinkPublisher::new(
                self.config.uplink.clone(),
                session_id,
                Arc::clone(&self.store),
                self.writer.clone(),
                self.bus.clone(),
                transport,
            );
            uplink = Some(publisher.stats());
            tasks.push(("uplink", tokio::spawn(publisher.run(cancel.clone()))));
        }

        self.writer.activate_session(session_id);
        info!("Session {} started with {} tasks", session_id, tasks.len());
        sessions.insert(
            session_id,
            ActiveSession {
                cancel,
                tasks,
                readers,
                uplink,
            },
        );
        Ok(())
    }

    /// Cancel and await a session's tasks, then drop its state
    ///
    /// # Errors
    ///
    /// Returns `CartelemError::Session` if the session is not active.
    pub async fn stop(&self, session_id: SessionId) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .ok_or_else(|| {
                CartelemError::Session(format!("session {} is not active", session_id))
            })?;

        session.cancel.cancel();
        for (name, handle) in session.tasks {
            if let Err(e) = handle.await {
                warn!("Session {} {} task ended abnormally: {}", session_id, name, e);
            }
        }

        self.writer.deactivate_session(session_id);
        self.store.clear_session(session_id);
        info!("Session {} stopped", session_id);
        Ok(())
    }

    /// Stop every active session
    pub async fn shutdown(&self) {
        self.root.cancel();
        for session_id in self.active_sessions() {
            if let Err(e) = self.stop(session_id).await {
                warn!("Failed to stop session {}: {}", session_id, e);
            }
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn is_active(&self, session_id: SessionId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&session_id)
    }

    /// Status of each reader of a session, `None` if it is not active
    pub fn reader_status(&self, session_id: SessionId) -> Option<Vec<ReaderReport>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .map(|s| s.readers.iter().map(|r| r.report()).collect())
    }

    pub fn uplink_stats(&self, session_id: SessionId) -> Option<UplinkStatistics> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .and_then(|s| s.uplink.as_ref().map(|u| u.snapshot()))
    }
}
