//! # Telemetry Envelope
//!
//! The normalized record every reader produces and every sink consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use tokio::time::Instant;

/// Externally owned session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Satellite navigation (NMEA)
    Satnav,
    /// On-board diagnostics (OBD-II)
    Diagnostics,
    /// Radio uplink status
    Uplink,
}

impl Source {
    /// Lowercase name used in logs and file records
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Satnav => "satnav",
            Source::Diagnostics => "diagnostics",
            Source::Uplink => "uplink",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reading quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Value present and parsed
    Good,
    /// Source reported no fix or no value yet
    NoData,
    /// Reply was malformed, unsupported or out of range
    Error,
}

/// Normalized telemetry reading
///
/// Immutable once built; sinks receive clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    pub source: Source,
    pub channel: String,
    pub value_numeric: Option<f64>,
    pub value_text: Option<String>,
    pub unit: String,
    pub quality: Quality,
    pub ts_wall: DateTime<Utc>,
    /// Nanoseconds on the producing reader's monotonic clock
    pub ts_monotonic: u64,
}

impl Envelope {
    /// Good numeric reading
    pub fn numeric(
        session_id: SessionId,
        source: Source,
        channel: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        ts_monotonic: u64,
    ) -> Self {
        Self {
            session_id,
            source,
            channel: channel.into(),
            value_numeric: Some(value),
            value_text: None,
            unit: unit.into(),
            quality: Quality::Good,
            ts_wall: Utc::now(),
            ts_monotonic,
        }
    }

    /// Good text reading
    pub fn text(
        session_id: SessionId,
        source: Source,
        channel: impl Into<String>,
        value: impl Into<String>,
        unit: impl Into<String>,
        ts_monotonic: u64,
    ) -> Self {
        Self {
            session_id,
            source,
            channel: channel.into(),
            value_numeric: None,
            value_text: Some(value.into()),
            unit: unit.into(),
            quality: Quality::Good,
            ts_wall: Utc::now(),
            ts_monotonic,
        }
    }

    /// Valueless reading carrying `NoData` or `Error` quality
    pub fn without_value(
        session_id: SessionId,
        source: Source,
        channel: impl Into<String>,
        unit: impl Into<String>,
        quality: Quality,
        ts_monotonic: u64,
    ) -> Self {
        Self {
            session_id,
            source,
            channel: channel.into(),
            value_numeric: None,
            value_text: None,
            unit: unit.into(),
            quality,
            ts_wall: Utc::now(),
            ts_monotonic,
        }
    }

    /// Numeric value, only when the reading is good
    pub fn good_numeric(&self) -> Option<f64> {
        match self.quality {
            Quality::Good => self.value_numeric,
            _ => None,
        }
    }
}

/// Per-reader monotonic clock
///
/// Successive calls to [`MonotonicClock::now_ns`] never go backwards.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Nanoseconds since the clock was created
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Content of a frame snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum FramePayload {
    /// Last-known values of a session at snapshot time
    State(Vec<Envelope>),
    /// Encoded uplink frame exactly as handed to the radio
    Uplink(#[serde(with = "hex_bytes")] Vec<u8>),
}

/// Point-in-time record persisted through the writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSnapshot {
    pub session_id: SessionId,
    pub ts_wall: DateTime<Utc>,
    pub ts_monotonic: u64,
    pub payload: FramePayload,
}

impl FrameSnapshot {
    pub fn new(session_id: SessionId, ts_monotonic: u64, payload: FramePayload) -> Self {
        Self {
            session_id,
            ts_wall: Utc::now(),
            ts_monotonic,
            payload,
        }
    }
}

/// Lowercase hex rendering of raw bytes
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Inverse of [`to_hex`]; `None` on odd length or a non-hex character
pub(crate) fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits = text.as_bytes();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}

/// Hex (de)serialization for uplink payload bytes
mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::from_hex(&s).ok_or_else(|| D::Error::custom(format!("invalid hex payload {:?}", s)))
    }
}
