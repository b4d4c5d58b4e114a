//! # OBD-II Mode 01 PIDs
//!
//! The monitored parameter set and the SAE J1979 formulas that turn
//! response data bytes into engineering values.

use serde::Deserialize;
use std::fmt;

use crate::error::{CartelemError, Result};

/// Supported Mode 01 parameter identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Pid {
    #[serde(rename = "ENGINE_LOAD")]
    EngineLoad,
    #[serde(rename = "COOLANT_TEMP")]
    CoolantTemp,
    #[serde(rename = "FUEL_PRESSURE")]
    FuelPressure,
    #[serde(rename = "RPM")]
    Rpm,
    #[serde(rename = "SPEED")]
    Speed,
    #[serde(rename = "TIMING_ADVANCE")]
    TimingAdvance,
    #[serde(rename = "INTAKE_TEMP")]
    IntakeTemp,
    #[serde(rename = "MAF")]
    Maf,
    #[serde(rename = "THROTTLE_POS")]
    ThrottlePos,
    #[serde(rename = "FUEL_LEVEL")]
    FuelLevel,
}

impl Pid {
    pub const ALL: [Pid; 10] = [
        Pid::EngineLoad,
        Pid::CoolantTemp,
        Pid::FuelPressure,
        Pid::Rpm,
        Pid::Speed,
        Pid::TimingAdvance,
        Pid::IntakeTemp,
        Pid::Maf,
        Pid::ThrottlePos,
        Pid::FuelLevel,
    ];

    /// Mode 01 PID byte
    pub fn code(&self) -> u8 {
        match self {
            Pid::EngineLoad => 0x04,
            Pid::CoolantTemp => 0x05,
            Pid::FuelPressure => 0x0A,
            Pid::Rpm => 0x0C,
            Pid::Speed => 0x0D,
            Pid::TimingAdvance => 0x0E,
            Pid::IntakeTemp => 0x0F,
            Pid::Maf => 0x10,
            Pid::ThrottlePos => 0x11,
            Pid::FuelLevel => 0x2F,
        }
    }

    /// Channel name used in envelopes and config files
    pub fn name(&self) -> &'static str {
        match self {
            Pid::EngineLoad => "ENGINE_LOAD",
            Pid::CoolantTemp => "COOLANT_TEMP",
            Pid::FuelPressure => "FUEL_PRESSURE",
            Pid::Rpm => "RPM",
            Pid::Speed => "SPEED",
            Pid::TimingAdvance => "TIMING_ADVANCE",
            Pid::IntakeTemp => "INTAKE_TEMP",
            Pid::Maf => "MAF",
            Pid::ThrottlePos => "THROTTLE_POS",
            Pid::FuelLevel => "FUEL_LEVEL",
        }
    }

    pub fn from_name(name: &str) -> Option<Pid> {
        Pid::ALL.iter().copied().find(|pid| pid.name() == name)
    }

    pub fn default_unit(&self) -> &'static str {
        match self {
            Pid::EngineLoad | Pid::ThrottlePos | Pid::FuelLevel => "%",
            Pid::CoolantTemp | Pid::IntakeTemp => "°C",
            Pid::FuelPressure => "kPa",
            Pid::Rpm => "rpm",
            Pid::Speed => "kph",
            Pid::TimingAdvance => "°",
            Pid::Maf => "g/s",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Pid::EngineLoad => "Calculated engine load",
            Pid::CoolantTemp => "Engine coolant temperature",
            Pid::FuelPressure => "Fuel rail pressure",
            Pid::Rpm => "Engine RPM",
            Pid::Speed => "Vehicle speed",
            Pid::TimingAdvance => "Timing advance",
            Pid::IntakeTemp => "Intake air temperature",
            Pid::Maf => "Mass air flow rate",
            Pid::ThrottlePos => "Throttle position",
            Pid::FuelLevel => "Fuel tank level",
        }
    }

    /// Number of data bytes in a response
    pub fn data_len(&self) -> usize {
        match self {
            Pid::Rpm | Pid::Maf => 2,
            _ => 1,
        }
    }

    /// ELM327 request string, without the trailing carriage return
    pub fn request(&self) -> String {
        format!("01{:02X}", self.code())
    }

    /// Apply the J1979 formula to the response data bytes
    ///
    /// # Errors
    ///
    /// Returns `Parse` if fewer data bytes than the PID needs are given.
    pub fn decode(&self, data: &[u8]) -> Result<f64> {
        if data.len() < self.data_len() {
            return Err(CartelemError::Parse(format!(
                "{} needs {} data bytes, got {}",
                self.name(),
                self.data_len(),
                data.len()
            )));
        }

        let a = data[0] as f64;
        let value = match self {
            Pid::EngineLoad | Pid::ThrottlePos | Pid::FuelLevel => a * 100.0 / 255.0,
            Pid::CoolantTemp | Pid::IntakeTemp => a - 40.0,
            Pid::FuelPressure => a * 3.0,
            Pid::Rpm => (a * 256.0 + data[1] as f64) / 4.0,
            Pid::Speed => a,
            Pid::TimingAdvance => a / 2.0 - 64.0,
            Pid::Maf => (a * 256.0 + data[1] as f64) / 100.0,
        };

        Ok(value)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
