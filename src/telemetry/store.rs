//! # Last-Known-Value Store
//!
//! Most recent envelope per (session, source, channel). One writer (the
//! dispatcher) and many readers (uplink publisher, writer snapshots) share
//! it through an `Arc`; a `RwLock` keeps reads whole.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::envelope::{Envelope, SessionId, Source};

type ChannelKey = (Source, String);

/// Shared table of latest readings
#[derive(Debug, Default)]
pub struct LastKnownValueStore {
    sessions: RwLock<HashMap<SessionId, HashMap<ChannelKey, Envelope>>>,
}

impl LastKnownValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the entry for the envelope's key
    pub fn update(&self, envelope: &Envelope) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(envelope.session_id)
            .or_default()
            .insert((envelope.source, envelope.channel.clone()), envelope.clone());
    }

    pub fn get(&self, session_id: SessionId, source: Source, channel: &str) -> Option<Envelope> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(&session_id)
            .and_then(|channels| channels.get(&(source, channel.to_string())))
            .cloned()
    }

    /// Copy of every entry for a session, ordered by (source, channel)
    pub fn snapshot(&self, session_id: SessionId) -> Vec<Envelope> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<Envelope> = sessions
            .get(&session_id)
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| (a.source, &a.channel).cmp(&(b.source, &b.channel)));
        entries
    }

    /// Drop all entries of a stopped session
    pub fn clear_session(&self, session_id: SessionId) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(&session_id);
    }

    /// Number of channels held for a session
    pub fn len(&self, session_id: SessionId) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(&session_id).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, session_id: SessionId) -> bool {
        self.len(session_id) == 0
    }
}
