//! # Uplink Codec Module
//!
//! Compact fixed-record binary frames for the low-bandwidth radio link.
//!
//! This module handles:
//! - The field table (type tag, identifier, fixed-point scale)
//! - Encoding with range checks on the scaled i32
//! - Decoding with version, length and field validation
//!
//! The codec is stateless and performs no I/O.

pub mod decoder;
pub mod encoder;
pub mod protocol;

pub use decoder::decode_frame;
pub use encoder::encode_frame;
pub use protocol::UplinkField;
