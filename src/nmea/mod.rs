//! # NMEA 0183 Protocol Module
//!
//! Implementation of the subset of NMEA 0183 used by GPS receivers.
//!
//! This module handles:
//! - XOR checksum calculation and validation
//! - Sentence framing and field-count checks (GGA, RMC, VTG)
//! - Field interpretation, including degrees/decimal-minutes conversion

pub mod checksum;
pub mod parser;
pub mod sentence;
