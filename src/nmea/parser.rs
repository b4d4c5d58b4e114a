//! # NMEA Field Interpretation
//!
//! Turns framed GGA/RMC/VTG sentences into per-channel readings. An empty
//! field becomes [`FieldValue::Empty`] and an unparsable one becomes
//! [`FieldValue::Invalid`]; neither aborts the rest of the sentence.

use super::sentence::{split_sentence, RawSentence, SentenceKind};
use crate::error::{CartelemError, Result};

pub const CH_LATITUDE: &str = "latitude";
pub const CH_LONGITUDE: &str = "longitude";
pub const CH_ALTITUDE: &str = "altitude";
pub const CH_FIX_QUALITY: &str = "fix_quality";
pub const CH_SATELLITES: &str = "satellites";
pub const CH_HDOP: &str = "hdop";
pub const CH_SPEED_KPH: &str = "speed_kph";
pub const CH_COURSE: &str = "course";
pub const CH_FIX_VALID: &str = "fix_valid";

/// Knots to km/h
const KNOTS_TO_KPH: f64 = 1.852;

/// Value of a single channel within a sentence
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(f64),
    /// Field present but empty (receiver has no data)
    Empty,
    /// Field present but unparsable
    Invalid(String),
}

/// One channel produced by a sentence
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelReading {
    pub channel: &'static str,
    pub unit: &'static str,
    pub value: FieldValue,
}

impl ChannelReading {
    fn new(channel: &'static str, unit: &'static str, value: FieldValue) -> Self {
        Self { channel, unit, value }
    }
}

/// Readings extracted from one sentence
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSentence {
    pub kind: SentenceKind,
    pub readings: Vec<ChannelReading>,
}

impl ParsedSentence {
    /// Look up a channel, mainly for tests and diagnostics
    pub fn get(&self, channel: &str) -> Option<&FieldValue> {
        self.readings.iter().find(|r| r.channel == channel).map(|r| &r.value)
    }
}

/// Convert degrees + decimal minutes to signed decimal degrees
///
/// S and W hemispheres are negative.
///
/// # Examples
///
/// ```
/// use cartelem::nmea::parser::ddm_to_decimal;
///
/// let lat = ddm_to_decimal(37.0, 46.494, 'N').unwrap();
/// assert!((lat - 37.7749).abs() < 1e-9);
/// ```
pub fn ddm_to_decimal(degrees: f64, minutes: f64, hemisphere: char) -> Result<f64> {
    let sign = match hemisphere.to_ascii_uppercase() {
        'N' | 'E' => 1.0,
        'S' | 'W' => -1.0,
        other => {
            return Err(CartelemError::Parse(format!("invalid hemisphere {:?}", other)));
        }
    };
    Ok(sign * (degrees + minutes / 60.0))
}

/// Parse a `DDDMM.MMMM` field plus its hemisphere letter
fn coordinate(value: &str, hemisphere: &str, max_degrees: f64) -> FieldValue {
    if value.is_empty() || hemisphere.is_empty() {
        return FieldValue::Empty;
    }

    if !value.is_ascii() {
        return FieldValue::Invalid(format!("non-ASCII coordinate {:?}", value));
    }

    // Degrees are everything before the last two integer digits
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 2 {
        return FieldValue::Invalid(format!("coordinate too short: {:?}", value));
    }
    let (deg_str, min_str) = value.split_at(dot - 2);
    let degrees = if deg_str.is_empty() { Ok(0.0) } else { deg_str.parse::<f64>() };
    let minutes = min_str.parse::<f64>();

    let (degrees, minutes) = match (degrees, minutes) {
        (Ok(d), Ok(m)) if d >= 0.0 && (0.0..60.0).contains(&m) => (d, m),
        _ => return FieldValue::Invalid(format!("malformed coordinate {:?}", value)),
    };

    let mut chars = hemisphere.chars();
    let letter = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => return FieldValue::Invalid(format!("malformed hemisphere {:?}", hemisphere)),
    };

    match ddm_to_decimal(degrees, minutes, letter) {
        Ok(dd) if dd.abs() <= max_degrees => FieldValue::Value(dd),
        Ok(dd) => FieldValue::Invalid(format!("coordinate {} out of range", dd)),
        Err(e) => FieldValue::Invalid(e.to_string()),
    }
}

fn number(field: &str) -> FieldValue {
    if field.is_empty() {
        return FieldValue::Empty;
    }
    match field.parse::<f64>() {
        Ok(v) if v.is_finite() => FieldValue::Value(v),
        _ => FieldValue::Invalid(format!("not a number: {:?}", field)),
    }
}

fn scaled(value: FieldValue, factor: f64) -> FieldValue {
    match value {
        FieldValue::Value(v) => FieldValue::Value(v * factor),
        other => other,
    }
}

fn parse_gga(f: &[&str]) -> Vec<ChannelReading> {
    vec![
        ChannelReading::new(CH_LATITUDE, "deg", coordinate(f[1], f[2], 90.0)),
        ChannelReading::new(CH_LONGITUDE, "deg", coordinate(f[3], f[4], 180.0)),
        ChannelReading::new(CH_FIX_QUALITY, "count", number(f[5])),
        ChannelReading::new(CH_SATELLITES, "count", number(f[6])),
        ChannelReading::new(CH_HDOP, "dimensionless", number(f[7])),
        ChannelReading::new(CH_ALTITUDE, "m", number(f[8])),
    ]
}

fn parse_rmc(f: &[&str]) -> Vec<ChannelReading> {
    let status = match f[1] {
        "A" => FieldValue::Value(1.0),
        "V" => FieldValue::Value(0.0),
        "" => FieldValue::Empty,
        other => FieldValue::Invalid(format!("unknown status {:?}", other)),
    };
    let void = status == FieldValue::Value(0.0);

    let mut readings = vec![ChannelReading::new(CH_FIX_VALID, "bool", status)];
    let navigation = [
        ChannelReading::new(CH_LATITUDE, "deg", coordinate(f[2], f[3], 90.0)),
        ChannelReading::new(CH_LONGITUDE, "deg", coordinate(f[4], f[5], 180.0)),
        ChannelReading::new(CH_SPEED_KPH, "kph", scaled(number(f[6]), KNOTS_TO_KPH)),
        ChannelReading::new(CH_COURSE, "deg", number(f[7])),
    ];

    // A void fix carries stale numbers; report them as no data
    readings.extend(navigation.into_iter().map(|mut r| {
        if void {
            r.value = FieldValue::Empty;
        }
        r
    }));
    readings
}

fn parse_vtg(f: &[&str]) -> Vec<ChannelReading> {
    vec![
        ChannelReading::new(CH_COURSE, "deg", number(f[0])),
        ChannelReading::new(CH_SPEED_KPH, "kph", number(f[6])),
    ]
}

fn interpret(sentence: &RawSentence<'_>) -> ParsedSentence {
    let readings = match sentence.kind {
        SentenceKind::Gga => parse_gga(&sentence.fields),
        SentenceKind::Rmc => parse_rmc(&sentence.fields),
        SentenceKind::Vtg => parse_vtg(&sentence.fields),
    };
    ParsedSentence { kind: sentence.kind, readings }
}

/// Parse one NMEA line
///
/// # Returns
///
/// * `Ok(Some(_))` - Readings for a GGA, RMC or VTG sentence
/// * `Ok(None)` - Sentence kind not handled
///
/// # Errors
///
/// Returns `Parse` if the sentence fails framing, checksum or field-count
/// validation.
pub fn parse_sentence(line: &str) -> Result<Option<ParsedSentence>> {
    Ok(split_sentence(line)?.map(|raw| interpret(&raw)))
}
