//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field has a default, so an empty file is a
//! valid configuration. Values are range-checked once at load time.

use serde::de::Error;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CartelemError, Result};
use crate::obd::pids::Pid;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub gps: GpsConfig,

    #[serde(default)]
    pub obd: ObdConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub uplink: UplinkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Satellite-navigation (NMEA) reader configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GpsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_gps_port")]
    pub port: String,

    #[serde(default = "default_gps_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_gps_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum emissions per channel per second
    #[serde(default = "default_gps_rate_hz")]
    pub rate_hz: f64,
}

/// Diagnostics (OBD-II via ELM327) reader configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ObdConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_obd_port")]
    pub port: String,

    #[serde(default = "default_obd_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_obd_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_pids")]
    pub pids: Vec<PidConfig>,
}

/// One monitored PID
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PidConfig {
    #[serde(rename = "name")]
    pub pid: Pid,

    pub rate_hz: f64,

    /// Empty means the PID's standard unit
    #[serde(default)]
    pub unit: String,

    #[serde(default)]
    pub description: String,
}

impl PidConfig {
    /// PID with its standard unit and description
    pub fn standard(pid: Pid, rate_hz: f64) -> Self {
        Self {
            pid,
            rate_hz,
            unit: pid.default_unit().to_string(),
            description: pid.description().to_string(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }
}

/// Reconnect backoff shared by all readers
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Batching writer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WriterConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

/// JSONL storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Distribution bus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Outbound queue depth per subscriber
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

/// Radio uplink configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UplinkConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_publish_rate_hz")]
    pub publish_rate_hz: f64,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    /// Serial radio device; frames are only logged when unset
    #[serde(default)]
    pub device_path: Option<String>,

    #[serde(default = "default_uplink_baud_rate")]
    pub baud_rate: u32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_enabled() -> bool { true }

fn default_gps_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_gps_baud_rate() -> u32 { 4800 }
fn default_gps_timeout_ms() -> u64 { 3000 }
fn default_gps_rate_hz() -> f64 { 1.0 }

fn default_obd_port() -> String { "/dev/ttyUSB1".to_string() }
fn default_obd_baud_rate() -> u32 { 38400 }
fn default_obd_timeout_ms() -> u64 { 5000 }
fn default_pids() -> Vec<PidConfig> {
    vec![
        PidConfig::standard(Pid::Speed, 10.0),
        PidConfig::standard(Pid::Rpm, 10.0),
        PidConfig::standard(Pid::ThrottlePos, 5.0),
        PidConfig::standard(Pid::EngineLoad, 5.0),
        PidConfig::standard(Pid::CoolantTemp, 2.0),
        PidConfig::standard(Pid::FuelLevel, 1.0),
        PidConfig::standard(Pid::IntakeTemp, 2.0),
        PidConfig::standard(Pid::Maf, 5.0),
        PidConfig::standard(Pid::TimingAdvance, 5.0),
        PidConfig::standard(Pid::FuelPressure, 2.0),
    ]
}

fn default_initial_delay_ms() -> u64 { 1000 }
fn default_max_delay_ms() -> u64 { 30000 }
fn default_max_attempts() -> u32 { 10 }

fn default_batch_size() -> usize { 100 }
fn default_batch_timeout_ms() -> u64 { 1000 }
fn default_frame_interval_ms() -> u64 { 1000 }
fn default_max_queue_size() -> usize { 10000 }

fn default_data_dir() -> String { "./data".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_heartbeat_interval_ms() -> u64 { 5000 }
fn default_subscriber_buffer() -> usize { 256 }

fn default_publish_rate_hz() -> f64 { 1.0 }
fn default_max_payload_size() -> usize { 64 }
fn default_uplink_baud_rate() -> u32 { 38400 }

fn default_log_level() -> String { "info".to_string() }

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_gps_port(),
            baud_rate: default_gps_baud_rate(),
            timeout_ms: default_gps_timeout_ms(),
            rate_hz: default_gps_rate_hz(),
        }
    }
}

impl Default for ObdConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_obd_port(),
            baud_rate: default_obd_baud_rate(),
            timeout_ms: default_obd_timeout_ms(),
            pids: default_pids(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            publish_rate_hz: default_publish_rate_hz(),
            max_payload_size: default_max_payload_size(),
            device_path: None,
            baud_rate: default_uplink_baud_rate(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Baud rates accepted for any serial device
const SUPPORTED_BAUD_RATES: &[u32] = &[4800, 9600, 19200, 38400, 57600, 115200];

/// Accepted values for `logging.level`
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn invalid(msg: impl std::fmt::Display) -> CartelemError {
    CartelemError::Config(toml::de::Error::custom(msg))
}

fn check_range_ms(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(invalid(format!("{} must be between 1 and {}", name, max)));
    }
    Ok(())
}

fn check_rate_hz(name: &str, value: f64, max: f64) -> Result<()> {
    if !(value > 0.0 && value <= max) {
        return Err(invalid(format!("{} must be greater than 0 and at most {}", name, max)));
    }
    Ok(())
}

fn check_baud(name: &str, value: u32) -> Result<()> {
    if !SUPPORTED_BAUD_RATES.contains(&value) {
        return Err(invalid(format!(
            "{} must be one of: 4800, 9600, 19200, 38400, 57600, 115200",
            name
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use cartelem::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse, fill PID defaults and validate
    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.obd.fill_pid_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Readers
        if self.gps.enabled {
            if self.gps.port.is_empty() {
                return Err(invalid("gps port cannot be empty when enabled"));
            }
            check_baud("gps.baud_rate", self.gps.baud_rate)?;
            check_range_ms("gps.timeout_ms", self.gps.timeout_ms, 60000)?;
            check_rate_hz("gps.rate_hz", self.gps.rate_hz, 50.0)?;
        }

        if self.obd.enabled {
            if self.obd.port.is_empty() {
                return Err(invalid("obd port cannot be empty when enabled"));
            }
            check_baud("obd.baud_rate", self.obd.baud_rate)?;
            check_range_ms("obd.timeout_ms", self.obd.timeout_ms, 60000)?;

            let mut seen = HashSet::new();
            for pid in &self.obd.pids {
                if !seen.insert(pid.pid) {
                    return Err(invalid(format!("PID {} is configured more than once", pid.pid)));
                }
                check_rate_hz(&format!("rate_hz of PID {}", pid.pid), pid.rate_hz, 50.0)?;
                if pid.unit.is_empty() {
                    return Err(invalid(format!("unit of PID {} cannot be empty", pid.pid)));
                }
            }
        }

        // Reconnect backoff
        check_range_ms("reconnect.initial_delay_ms", self.reconnect.initial_delay_ms, 600000)?;
        check_range_ms("reconnect.max_delay_ms", self.reconnect.max_delay_ms, 600000)?;
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(invalid("reconnect.max_delay_ms must not be less than initial_delay_ms"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts must be greater than 0"));
        }

        // Writer
        if self.writer.batch_size == 0 || self.writer.batch_size > 10000 {
            return Err(invalid("writer.batch_size must be between 1 and 10000"));
        }
        if self.writer.max_queue_size < self.writer.batch_size {
            return Err(invalid("writer.max_queue_size must not be less than batch_size"));
        }
        check_range_ms("writer.batch_timeout_ms", self.writer.batch_timeout_ms, 60000)?;
        check_range_ms("writer.frame_interval_ms", self.writer.frame_interval_ms, 3600000)?;

        // Storage
        if self.storage.data_dir.is_empty() {
            return Err(invalid("storage.data_dir cannot be empty"));
        }
        if self.storage.max_records_per_file == 0 {
            return Err(invalid("storage.max_records_per_file must be greater than 0"));
        }
        if self.storage.max_files_to_keep == 0 {
            return Err(invalid("storage.max_files_to_keep must be greater than 0"));
        }

        // Bus
        check_range_ms("bus.heartbeat_interval_ms", self.bus.heartbeat_interval_ms, 60000)?;
        if self.bus.subscriber_buffer == 0 {
            return Err(invalid("bus.subscriber_buffer must be greater than 0"));
        }

        // Uplink
        if self.uplink.enabled {
            check_rate_hz("uplink.publish_rate_hz", self.uplink.publish_rate_hz, 10.0)?;
            let max_frame = crate::codec::protocol::max_frame_size();
            if self.uplink.max_payload_size < crate::codec::protocol::frame_size(1)
                || self.uplink.max_payload_size > max_frame
            {
                return Err(invalid(format!(
                    "uplink.max_payload_size must be between 8 and {}",
                    max_frame
                )));
            }
            if let Some(path) = &self.uplink.device_path {
                if path.is_empty() {
                    return Err(invalid("uplink.device_path cannot be empty when set"));
                }
                check_baud("uplink.baud_rate", self.uplink.baud_rate)?;
            }
        }

        // Logging
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(invalid("logging.level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}

impl ObdConfig {
    /// Replace empty unit/description with the PID's standard values
    fn fill_pid_defaults(&mut self) {
        for pid in &mut self.pids {
            if pid.unit.is_empty() {
                pid.unit = pid.pid.default_unit().to_string();
            }
            if pid.description.is_empty() {
                pid.description = pid.pid.description().to_string();
            }
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl WriterConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl BusConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl UplinkConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.publish_rate_hz)
    }
}
