//! # Uplink Frame Constants and Field Table
//!
//! Wire layout (all multi-byte values little-endian):
//!
//! ```text
//! +---------+-------------+----------------------------------------+
//! | version | field_count | field_count x [tag | id | i32 scaled]  |
//! |   1 B   |     1 B     |              6 B each                  |
//! +---------+-------------+----------------------------------------+
//! ```

/// Current frame format version
pub const UPLINK_VERSION: u8 = 0x01;

/// Header size: version(1) + field_count(1)
pub const HEADER_SIZE: usize = 2;

/// Record size: tag(1) + id(1) + value(4)
pub const RECORD_SIZE: usize = 6;

/// Encoded size of a frame carrying `field_count` fields
pub const fn frame_size(field_count: usize) -> usize {
    HEADER_SIZE + RECORD_SIZE * field_count
}

/// Largest frame the one-byte field count can describe
pub const fn max_frame_size() -> usize {
    frame_size(u8::MAX as usize)
}

/// Most fields that fit in `ceiling` bytes
pub const fn fields_within(ceiling: usize) -> usize {
    if ceiling < HEADER_SIZE {
        0
    } else {
        (ceiling - HEADER_SIZE) / RECORD_SIZE
    }
}

/// Field-type tag (first byte of a record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Gps = 0x01,
    Obd = 0x02,
    Status = 0x03,
}

/// Fields the uplink can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UplinkField {
    Latitude,
    Longitude,
    Altitude,
    GpsSpeed,
    Heading,
    Satellites,
    Hdop,
    Speed,
    Rpm,
    ThrottlePos,
    EngineLoad,
    CoolantTemp,
    FuelLevel,
    IntakeTemp,
    Maf,
    TimingAdvance,
    FuelPressure,
}

impl UplinkField {
    pub const ALL: [UplinkField; 17] = [
        UplinkField::Latitude,
        UplinkField::Longitude,
        UplinkField::Altitude,
        UplinkField::GpsSpeed,
        UplinkField::Heading,
        UplinkField::Satellites,
        UplinkField::Hdop,
        UplinkField::Speed,
        UplinkField::Rpm,
        UplinkField::ThrottlePos,
        UplinkField::EngineLoad,
        UplinkField::CoolantTemp,
        UplinkField::FuelLevel,
        UplinkField::IntakeTemp,
        UplinkField::Maf,
        UplinkField::TimingAdvance,
        UplinkField::FuelPressure,
    ];

    pub fn field_type(&self) -> FieldType {
        match self {
            UplinkField::Latitude
            | UplinkField::Longitude
            | UplinkField::Altitude
            | UplinkField::GpsSpeed
            | UplinkField::Heading
            | UplinkField::Satellites
            | UplinkField::Hdop => FieldType::Gps,
            _ => FieldType::Obd,
        }
    }

    /// Field identifier (second byte of a record)
    pub fn id(&self) -> u8 {
        match self {
            UplinkField::Latitude => 0x01,
            UplinkField::Longitude => 0x02,
            UplinkField::Altitude => 0x03,
            UplinkField::GpsSpeed => 0x04,
            UplinkField::Heading => 0x05,
            UplinkField::Satellites => 0x06,
            UplinkField::Hdop => 0x07,
            UplinkField::Speed => 0x10,
            UplinkField::Rpm => 0x11,
            UplinkField::ThrottlePos => 0x12,
            UplinkField::EngineLoad => 0x13,
            UplinkField::CoolantTemp => 0x14,
            UplinkField::FuelLevel => 0x15,
            UplinkField::IntakeTemp => 0x16,
            UplinkField::Maf => 0x17,
            UplinkField::TimingAdvance => 0x18,
            UplinkField::FuelPressure => 0x19,
        }
    }

    /// Fixed-point scale applied before rounding to i32
    pub fn scale(&self) -> f64 {
        match self {
            UplinkField::Latitude | UplinkField::Longitude => 1e7,
            UplinkField::Altitude | UplinkField::GpsSpeed | UplinkField::Speed => 1e2,
            UplinkField::Hdop
            | UplinkField::CoolantTemp
            | UplinkField::IntakeTemp
            | UplinkField::Maf
            | UplinkField::TimingAdvance
            | UplinkField::FuelPressure => 1e1,
            UplinkField::Heading
            | UplinkField::Satellites
            | UplinkField::Rpm
            | UplinkField::ThrottlePos
            | UplinkField::EngineLoad
            | UplinkField::FuelLevel => 1.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UplinkField::Latitude => "latitude",
            UplinkField::Longitude => "longitude",
            UplinkField::Altitude => "altitude",
            UplinkField::GpsSpeed => "speed_kph",
            UplinkField::Heading => "course",
            UplinkField::Satellites => "satellites",
            UplinkField::Hdop => "hdop",
            UplinkField::Speed => "SPEED",
            UplinkField::Rpm => "RPM",
            UplinkField::ThrottlePos => "THROTTLE_POS",
            UplinkField::EngineLoad => "ENGINE_LOAD",
            UplinkField::CoolantTemp => "COOLANT_TEMP",
            UplinkField::FuelLevel => "FUEL_LEVEL",
            UplinkField::IntakeTemp => "INTAKE_TEMP",
            UplinkField::Maf => "MAF",
            UplinkField::TimingAdvance => "TIMING_ADVANCE",
            UplinkField::FuelPressure => "FUEL_PRESSURE",
        }
    }

    /// Reverse lookup from a record's tag and id bytes
    pub fn from_wire(tag: u8, id: u8) -> Option<UplinkField> {
        UplinkField::ALL
            .iter()
            .copied()
            .find(|f| f.field_type() as u8 == tag && f.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_frame_size() {
        assert_eq!(frame_size(0), 2);
        assert_eq!(frame_size(10), 62);
        assert_eq!(max_frame_size(), 1532);
    }

    #[test]
    fn test_fields_within_ceiling() {
        assert_eq!(fields_within(64), 10);
        assert_eq!(fields_within(20), 3);
        assert_eq!(fields_within(8), 1);
        assert_eq!(fields_within(7), 0);
        assert_eq!(fields_within(1), 0);
    }

    #[test]
    fn test_wire_identifiers_unique() {
        let keys: HashSet<(u8, u8)> = UplinkField::ALL
            .iter()
            .map(|f| (f.field_type() as u8, f.id()))
            .collect();
        assert_eq!(keys.len(), UplinkField::ALL.len());
    }

    #[test]
    fn test_from_wire_round_trip() {
        for field in UplinkField::ALL {
            assert_eq!(UplinkField::from_wire(field.field_type() as u8, field.id()), Some(field));
        }
        assert_eq!(UplinkField::from_wire(0x03, 0x01), None);
    }

    #[test]
    fn test_documented_scales() {
        assert_eq!(UplinkField::Latitude.scale(), 1e7);
        assert_eq!(UplinkField::Altitude.scale(), 1e2);
        assert_eq!(UplinkField::Speed.scale(), 1e2);
        assert_eq!(UplinkField::CoolantTemp.scale(), 1e1);
        assert_eq!(UplinkField::FuelPressure.scale(), 1e1);
    }
}
