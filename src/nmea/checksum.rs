//! # NMEA 0183 Checksum
//!
//! XOR of every byte between the leading `$` and the `*`, written as two
//! uppercase hex digits after the `*`.

/// Calculate the NMEA checksum of a sentence body
///
/// # Arguments
///
/// * `body` - Bytes between `$` and `*` (exclusive)
///
/// # Examples
///
/// ```
/// use cartelem::nmea::checksum::nmea_checksum;
///
/// assert_eq!(nmea_checksum(b"GPGLL,5057.970,N,00146.110,E,142451,A"), 0x27);
/// ```
pub fn nmea_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Parse the two hex digits that follow `*`
pub fn parse_checksum_digits(digits: &str) -> Option<u8> {
    if digits.len() != 2 {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

/// Append `*HH` to a sentence body, for building test fixtures and replay data
pub fn with_checksum(body: &str) -> String {
    format!("${}*{:02X}", body, nmea_checksum(body.as_bytes()))
}
