//! # Uplink Frame Encoder
//!
//! Packs named numeric fields into the fixed-record uplink layout.

use bytes::{BufMut, Bytes, BytesMut};

use super::protocol::*;
use crate::error::{CartelemError, Result};

/// Scale and round a value to its fixed-point wire form
///
/// # Errors
///
/// Returns `Range` if the scaled value is not finite or does not fit i32.
pub fn scale_value(field: UplinkField, value: f64) -> Result<i32> {
    let scaled = (value * field.scale()).round();
    if !scaled.is_finite() || scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
        return Err(CartelemError::Range {
            field: field.name().to_string(),
            value,
        });
    }
    Ok(scaled as i32)
}

/// Encode a complete uplink frame
///
/// # Arguments
///
/// * `fields` - Fields in transmission order
///
/// # Returns
///
/// * `Result<Bytes>` - Header followed by one 6-byte record per field
///
/// # Errors
///
/// Returns `Range` for the first value that does not fit, or `Codec` if
/// more than 255 fields are given.
///
/// # Examples
///
/// ```
/// use cartelem::codec::encoder::encode_frame;
/// use cartelem::codec::protocol::UplinkField;
///
/// let frame = encode_frame(&[(UplinkField::Latitude, 37.7749)]).unwrap();
/// assert_eq!(frame.len(), 8);
/// assert_eq!(&frame[..2], &[0x01, 0x01]);
/// ```
pub fn encode_frame(fields: &[(UplinkField, f64)]) -> Result<Bytes> {
    let count = u8::try_from(fields.len()).map_err(|_| {
        CartelemError::Codec(format!("{} fields exceed the 255-field frame limit", fields.len()))
    })?;

    let mut buf = BytesMut::with_capacity(frame_size(fields.len()));
    buf.put_u8(UPLINK_VERSION);
    buf.put_u8(count);

    for &(field, value) in fields {
        let scaled = scale_value(field, value)?;
        buf.put_u8(field.field_type() as u8);
        buf.put_u8(field.id());
        buf.put_i32_le(scaled);
    }

    Ok(buf.freeze())
}
