//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `station.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BusConfig: serial line settings for the RS-485 field bus.
//!     - SensorsConfig: unit identifier of every sensor on the bus.
//!     - AcquisitionConfig: poll / persist cadence and back-off.
//!     - StorageConfig: where daily files go and how long they are kept.
//!     - ReferenceConfig: air-quality and sun almanac lookup files.
//!     - LoggingConfig / ServerConfig: ambient knobs.
//!
//! every field has a default, so a partial file only overrides what it names.
//!
//! ==============================================================================

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::almanac::{parse_clock, SunTimes};
use crate::sensors::{Endpoint, EndpointRegistry, SensorKind};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StationConfig {
    pub bus: BusConfig,
    pub sensors: SensorsConfig,
    pub acquisition: AcquisitionConfig,
    pub storage: StorageConfig,
    pub reference: ReferenceConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub port: String,
    pub baud_rate: u32,
    /// "N", "E" or "O"
    pub parity: String,
    pub stop_bits: u8,
    pub data_bits: u8,
    pub timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            parity: "N".to_string(),
            stop_bits: 1,
            data_bits: 8,
            timeout_ms: 2000,
        }
    }
}

impl BusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorsConfig {
    pub environment: u8,
    pub uv: u8,
    /// reserved unit id; air quality is served from the reference file
    pub air_quality: u8,
    pub wind_speed: u8,
    pub wind_direction: u8,
    pub rainfall: u8,
    pub start_address: u16,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            environment: 1,
            uv: 2,
            air_quality: 3,
            wind_speed: 4,
            wind_direction: 5,
            rainfall: 6,
            start_address: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub poll_interval_ms: u64,
    pub persist_interval_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            persist_interval_secs: 30,
            reconnect_backoff_secs: 5,
            shutdown_timeout_ms: 2000,
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub rainfall_dir: PathBuf,
    pub retention_days: i64,
    pub permission_backoff_secs: u64,
    pub queue_poll_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("csv_data"),
            rainfall_dir: PathBuf::from("rainfall_data"),
            retention_days: 7,
            permission_backoff_secs: 5,
            queue_poll_ms: 1000,
        }
    }
}

impl StorageConfig {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn permission_backoff(&self) -> Duration {
        Duration::from_secs(self.permission_backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReferenceConfig {
    pub air_quality_file: PathBuf,
    pub sun_file: PathBuf,
    pub default_sunrise: String,
    pub default_sunset: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            air_quality_file: PathBuf::from("aqi").join("aqi_reference.csv"),
            sun_file: PathBuf::from("reference").join("sun_data.csv"),
            default_sunrise: "06:00".to_string(),
            default_sunset: "18:00".to_string(),
        }
    }
}

impl ReferenceConfig {
    /// fallback sun times when the almanac has no row for a date
    pub fn default_sun_times(&self) -> Option<SunTimes> {
        Some(SunTimes {
            sunrise: parse_clock(&self.default_sunrise)?,
            sunset: parse_clock(&self.default_sunset)?,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:3000".to_string() }
    }
}

impl StationConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let config: StationConfig = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("station.toml"),
            PathBuf::from("..").join("config").join("station.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// reject settings the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.bus.parity.to_ascii_uppercase().as_str(), "N" | "E" | "O") {
            bail!("bus.parity must be N, E or O (got {:?})", self.bus.parity);
        }
        if !matches!(self.bus.stop_bits, 1 | 2) {
            bail!("bus.stop_bits must be 1 or 2 (got {})", self.bus.stop_bits);
        }
        if !(5..=8).contains(&self.bus.data_bits) {
            bail!("bus.data_bits must be 5..=8 (got {})", self.bus.data_bits);
        }
        if self.bus.timeout_ms == 0 {
            bail!("bus.timeout_ms must be positive");
        }
        if self.acquisition.poll_interval_ms == 0 || self.acquisition.persist_interval_secs == 0 {
            bail!("acquisition intervals must be positive");
        }
        if self.storage.retention_days <= 0 {
            bail!("storage.retention_days must be positive");
        }
        if self.storage.queue_poll_ms == 0 {
            bail!("storage.queue_poll_ms must be positive");
        }
        if self.reference.default_sun_times().is_none() {
            bail!(
                "reference.default_sunrise/default_sunset must be HH:MM (got {:?}, {:?})",
                self.reference.default_sunrise,
                self.reference.default_sunset
            );
        }
        Ok(())
    }

    /// build the endpoint registry. called once at startup.
    pub fn endpoint_registry(&self) -> EndpointRegistry {
        let s = &self.sensors;
        EndpointRegistry::new(vec![
            Endpoint::new("environment", SensorKind::Environment, s.environment, s.start_address),
            Endpoint::new("uv", SensorKind::Uv, s.uv, s.start_address),
            Endpoint::new("wind_speed", SensorKind::WindSpeed, s.wind_speed, s.start_address),
            Endpoint::new("wind_direction", SensorKind::WindDirection, s.wind_direction, s.start_address),
            Endpoint::new("rainfall", SensorKind::Rainfall, s.rainfall, s.start_address),
        ])
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          STATION CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Bus: {} @ {} {}{}{}", self.bus.port, self.bus.baud_rate, self.bus.data_bits, self.bus.parity, self.bus.stop_bits);
        println!(
            "│ Units: env={} uv={} aq={} (reference file) wind={}/{} rain={}",
            self.sensors.environment,
            self.sensors.uv,
            self.sensors.air_quality,
            self.sensors.wind_speed,
            self.sensors.wind_direction,
            self.sensors.rainfall
        );
        println!("│ Poll Interval: {}ms", self.acquisition.poll_interval_ms);
        println!("│ Persist Interval: {}s", self.acquisition.persist_interval_secs);
        println!("│ Data Dir: {} ({} days kept)", self.storage.data_dir.display(), self.storage.retention_days);
        println!("│ Air Quality: {}", self.reference.air_quality_file.display());
        println!("│ API: {}", if self.server.enabled { self.server.bind.as_str() } else { "disabled" });
        println!("│ Log Level: {}", self.logging.level);
        println!("├─────────────────────────────────────────┤");
    }
}
