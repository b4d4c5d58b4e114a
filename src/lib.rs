//! # Cartelem Library
//!
//! Vehicle telemetry ingest for a car on the move.
//!
//! GPS (NMEA 0183) and OBD-II (ELM327) readers normalize device output into
//! telemetry envelopes. Each envelope updates a last-known-value table, is
//! fanned out to live subscribers and is batched into storage. A publisher
//! periodically packs the latest values into a compact binary frame for a
//! low-bandwidth radio.

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
pub mod nmea;
pub mod obd;
pub mod readers;
pub mod serial;
pub mod session;
pub mod telemetry;
pub mod uplink;
pub mod writer;
