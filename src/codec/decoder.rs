//! # Uplink Frame Decoder
//!
//! Inverse of the encoder, used by ground stations and tests.

use bytes::Buf;

use super::protocol::*;
use crate::error::{CartelemError, Result};

/// Decode a complete uplink frame
///
/// # Arguments
///
/// * `frame` - Frame bytes including the header
///
/// # Returns
///
/// * `Result<Vec<(UplinkField, f64)>>` - Fields in wire order, unscaled
///
/// # Errors
///
/// Returns `Codec` if:
/// - Frame is shorter than the header
/// - Version is unknown
/// - Length disagrees with the field count
/// - A record carries an unknown tag/id pair
pub fn decode_frame(frame: &[u8]) -> Result<Vec<(UplinkField, f64)>> {
    if frame.len() < HEADER_SIZE {
        return Err(CartelemError::Codec("Frame too short".to_string()));
    }

    let mut buf = frame;
    let version = buf.get_u8();
    if version != UPLINK_VERSION {
        return Err(CartelemError::Codec(format!("Unknown frame version: 0x{:02X}", version)));
    }

    let count = buf.get_u8() as usize;
    if frame.len() != frame_size(count) {
        return Err(CartelemError::Codec(format!(
            "Frame length {} does not match {} fields (expected {})",
            frame.len(),
            count,
            frame_size(count)
        )));
    }

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = buf.get_u8();
        let id = buf.get_u8();
        let raw = buf.get_i32_le();
        let field = UplinkField::from_wire(tag, id).ok_or_else(|| {
            CartelemError::Codec(format!("Unknown field tag 0x{:02X} id 0x{:02X}", tag, id))
        })?;
        fields.push((field, raw as f64 / field.scale()));
    }

    Ok(fields)
}
