//! # Telemetry Module
//!
//! The shared data model and the in-process plumbing around it.
//!
//! This module handles:
//! - The normalized [`Envelope`] record and frame snapshots
//! - The last-known-value table per (session, source, channel)
//! - Fanning new envelopes out to the store, the bus and the writer

pub mod dispatcher;
pub mod envelope;
pub mod store;

pub use dispatcher::Dispatcher;
pub use envelope::{
    Envelope, FramePayload, FrameSnapshot, MonotonicClock, Quality, SessionId, Source,
};
pub use store::LastKnownValueStore;
