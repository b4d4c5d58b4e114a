//! # NMEA Sentence Framing
//!
//! Splits a raw line into talker, sentence kind and data fields, and
//! validates checksum and field count before any field is interpreted.

use super::checksum::{nmea_checksum, parse_checksum_digits};
use crate::error::{CartelemError, Result};

/// Sentence kinds the satnav reader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SentenceKind {
    /// Global positioning fix data
    Gga,
    /// Recommended minimum navigation information
    Rmc,
    /// Track made good and ground speed
    Vtg,
}

impl SentenceKind {
    /// Map the three-letter sentence code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "GGA" => Some(SentenceKind::Gga),
            "RMC" => Some(SentenceKind::Rmc),
            "VTG" => Some(SentenceKind::Vtg),
            _ => None,
        }
    }

    /// Accepted data-field counts; the longer RMC/VTG forms carry the
    /// NMEA 2.3 mode indicator
    pub fn field_counts(&self) -> &'static [usize] {
        match self {
            SentenceKind::Gga => &[14],
            SentenceKind::Rmc => &[11, 12],
            SentenceKind::Vtg => &[8, 9],
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SentenceKind::Gga => "GGA",
            SentenceKind::Rmc => "RMC",
            SentenceKind::Vtg => "VTG",
        }
    }
}

/// A framed, checksum-verified sentence
#[derive(Debug, Clone, PartialEq)]
pub struct RawSentence<'a> {
    /// Two-letter talker (GP, GN, GL, ...)
    pub talker: &'a str,
    pub kind: SentenceKind,
    /// Data fields after the address field
    pub fields: Vec<&'a str>,
}

/// Frame and validate one line
///
/// # Returns
///
/// * `Ok(Some(_))` - Known sentence kind with valid checksum and field count
/// * `Ok(None)` - Well-formed but of a kind this reader ignores
///
/// # Errors
///
/// Returns `Parse` if the line does not start with `$`, the checksum is
/// malformed or wrong, or the field count does not match the schema.
pub fn split_sentence(line: &str) -> Result<Option<RawSentence<'_>>> {
    let line = line.trim();
    let content = line
        .strip_prefix('$')
        .ok_or_else(|| CartelemError::Parse(format!("missing '$' in {:?}", line)))?;

    let body = match content.split_once('*') {
        Some((body, digits)) => {
            let expected = parse_checksum_digits(digits.trim())
                .ok_or_else(|| CartelemError::Parse(format!("malformed checksum {:?}", digits)))?;
            let calculated = nmea_checksum(body.as_bytes());
            if calculated != expected {
                return Err(CartelemError::Parse(format!(
                    "checksum mismatch: expected 0x{:02X}, got 0x{:02X}",
                    expected, calculated
                )));
            }
            body
        }
        None => content,
    };

    let mut parts = body.split(',');
    let address = parts.next().unwrap_or_default();

    // Proprietary ($P...) and unknown sentences are skipped, not errors
    if address.starts_with('P') || address.len() != 5 || !address.is_ascii() {
        return Ok(None);
    }
    let (talker, code) = address.split_at(2);
    let kind = match SentenceKind::from_code(code) {
        Some(kind) => kind,
        None => return Ok(None),
    };

    let fields: Vec<&str> = parts.collect();
    if !kind.field_counts().contains(&fields.len()) {
        return Err(CartelemError::Parse(format!(
            "{} has {} fields, expected {:?}",
            kind.code(),
            fields.len(),
            kind.field_counts()
        )));
    }

    Ok(Some(RawSentence { talker, kind, fields }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmea::checksum::with_checksum;

    const GGA: &str = "GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,";

    #[test]
    fn test_split_valid_gga() {
        let line = with_checksum(GGA);
        let s = split_sentence(&line).unwrap().unwrap();
        assert_eq!(s.talker, "GP");
        assert_eq!(s.kind, SentenceKind::Gga);
        assert_eq!(s.fields.len(), 14);
        assert_eq!(s.fields[1], "4807.038");
    }

    #[test]
    fn test_split_without_checksum_is_accepted() {
        let line = format!("${}", GGA);
        assert!(split_sentence(&line).unwrap().is_some());
    }

    #[test]
    fn test_other_talkers_accepted() {
        let line = with_checksum(&GGA.replacen("GP", "GN", 1));
        let s = split_sentence(&line).unwrap().unwrap();
        assert_eq!(s.talker, "GN");
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let line = format!("${}*00", GGA);
        assert!(matches!(split_sentence(&line), Err(CartelemError::Parse(_))));
    }

    #[test]
    fn test_malformed_checksum_rejected() {
        let line = format!("${}*G", GGA);
        assert!(split_sentence(&line).is_err());
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        let line = with_checksum("GPGGA,123519,4807.038,N");
        assert!(matches!(split_sentence(&line), Err(CartelemError::Parse(_))));
    }

    #[test]
    fn test_missing_dollar_rejected() {
        assert!(split_sentence("GPGGA,1,2,3").is_err());
    }

    #[test]
    fn test_unknown_kind_ignored() {
        let line = with_checksum("GPGSV,3,1,11,03,03,111,00");
        assert_eq!(split_sentence(&line).unwrap(), None);
    }

    #[test]
    fn test_proprietary_ignored() {
        let line = with_checksum("PMTK001,314,3");
        assert_eq!(split_sentence(&line).unwrap(), None);
    }

    #[test]
    fn test_rmc_and_vtg_field_count_variants() {
        let rmc_old =
            with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W");
        let rmc_new =
            with_checksum("GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W,A");
        let vtg_old = with_checksum("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K");
        let vtg_new = with_checksum("GPVTG,054.7,T,034.4,M,005.5,N,010.2,K,A");
        for line in [rmc_old, rmc_new, vtg_old, vtg_new] {
            assert!(split_sentence(&line).unwrap().is_some(), "rejected {}", line);
        }
    }

    #[test]
    fn test_trailing_whitespace_tolerated() {
        let line = format!("{}\r\n", with_checksum(GGA));
        assert!(split_sentence(&line).unwrap().is_some());
    }
}
