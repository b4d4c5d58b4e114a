//! # OBD-II Protocol Module
//!
//! ELM327 adapter dialogue and Mode 01 PID decoding.
//!
//! This module handles:
//! - The monitored PID table with units, descriptions and formulas
//! - Adapter initialization commands
//! - Parsing adapter replies, including "unsupported" markers

pub mod elm327;
pub mod pids;
