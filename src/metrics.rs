//! ==============================================================================
//! metrics.rs - derived metrics
//! ==============================================================================
//!
//! purpose:
//!     stateful and stateless transforms on top of raw sensor readings:
//!     - daily rainfall from a cumulative (odometer) gauge, reset at midnight
//!     - AQI from PM2.5 via piecewise-linear breakpoints
//!     - categorical bands (label + color) for AQI, UV and humidity
//!
//! rainfall state machine:
//!
//!     Uninitialized --first reading--> Tracking(day)
//!     Tracking(day) --reading, same day--> Tracking(day)   (add delta if >= 0)
//!     Tracking(day) --reading, new day---> flush(day, total) -> Tracking(new day)
//!
//!     a negative delta is a gauge counter reset: re-baseline, add nothing.
//!
//! ==============================================================================

use chrono::NaiveDate;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::error::StorageError;

// ==============================================================================
// rainfall
// ==============================================================================

/// durable sink for per-day rainfall totals
pub trait RainfallLedger: Send {
    fn record(&mut self, date: NaiveDate, total_mm: f64) -> Result<(), StorageError>;
}

/// appends `Date,Rainfall (mm)` rows to a single running csv
pub struct CsvRainfallLedger {
    path: PathBuf,
}

impl CsvRainfallLedger {
    pub const FILE_NAME: &'static str = "daily_rainfall_totals.csv";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { path: dir.into().join(Self::FILE_NAME) }
    }
}

impl RainfallLedger for CsvRainfallLedger {
    fn record(&mut self, date: NaiveDate, total_mm: f64) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let is_new = !self.path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);
        if is_new {
            writer.write_record(["Date", "Rainfall (mm)"])?;
        }
        writer.write_record([date.format("%Y-%m-%d").to_string(), format!("{total_mm:.1}")])?;
        writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RainState {
    Uninitialized,
    Tracking { day: NaiveDate, last_raw: f64, daily_total: f64 },
}

pub struct RainfallAccumulator {
    state: RainState,
    ledger: Box<dyn RainfallLedger>,
}

impl RainfallAccumulator {
    pub fn new(ledger: Box<dyn RainfallLedger>) -> Self {
        Self { state: RainState::Uninitialized, ledger }
    }

    #[cfg(test)]
    pub fn daily_total(&self) -> Option<f64> {
        match self.state {
            RainState::Uninitialized => None,
            RainState::Tracking { daily_total, .. } => Some(daily_total),
        }
    }

    /// feed one raw gauge reading taken on `today`; returns today's total in mm
    pub fn process(&mut self, raw: f64, today: NaiveDate) -> f64 {
        match self.state {
            RainState::Tracking { day, last_raw, daily_total } if day == today => {
                let increment = raw - last_raw;
                let daily_total = if increment >= 0.0 {
                    daily_total + increment
                } else {
                    tracing::warn!(previous = last_raw, current = raw, "rain gauge counter reset detected");
                    daily_total
                };
                self.state = RainState::Tracking { day, last_raw: raw, daily_total };
                daily_total
            }
            RainState::Tracking { day, daily_total, .. } => {
                // day-boundary flush: the total belongs to the day it was collected on
                tracing::info!(date = %day, total_mm = daily_total, "rainfall day closed");
                if let Err(e) = self.ledger.record(day, daily_total) {
                    tracing::error!(date = %day, error = %e, "failed to store daily rainfall total");
                }
                self.state = RainState::Tracking { day: today, last_raw: raw, daily_total: 0.0 };
                0.0
            }
            RainState::Uninitialized => {
                self.state = RainState::Tracking { day: today, last_raw: raw, daily_total: 0.0 };
                0.0
            }
        }
    }
}

// ==============================================================================
// aqi
// ==============================================================================

/// (concentration_lo, concentration_hi, index_lo, index_hi)
const PM25_BREAKPOINTS: [(f64, f64, f64, f64); 6] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.0, 35.4, 50.0, 100.0),
    (35.4, 55.4, 100.0, 150.0),
    (55.4, 150.4, 150.0, 200.0),
    (150.4, 250.4, 200.0, 300.0),
    (250.4, 500.4, 300.0, 500.0),
];

/// PM2.5 (µg/m³) to AQI. continuous across breakpoints; concentrations above
/// the last breakpoint extrapolate along the top segment without clamping.
pub fn aqi_from_pm25(pm2_5: Option<f64>) -> Option<f64> {
    let pm = pm2_5?;
    if !pm.is_finite() || pm < 0.0 {
        return None;
    }
    let (c_lo, c_hi, i_lo, i_hi) = PM25_BREAKPOINTS
        .iter()
        .copied()
        .find(|(_, c_hi, _, _)| pm <= *c_hi)
        .unwrap_or(PM25_BREAKPOINTS[PM25_BREAKPOINTS.len() - 1]);
    Some(i_lo + (pm - c_lo) / (c_hi - c_lo) * (i_hi - i_lo))
}

// ==============================================================================
// bands
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Band {
    pub label: &'static str,
    pub color: &'static str,
}

impl Band {
    pub const UNAVAILABLE: Band = Band { label: "N/A", color: "#FFFFFF" };

    const fn new(label: &'static str, color: &'static str) -> Self {
        Self { label, color }
    }
}

/// (inclusive upper bound, band); the last entry catches everything above
type BandTable = [(f64, Band)];

const AQI_BANDS: &BandTable = &[
    (50.0, Band::new("GOOD", "#39FF14")),
    (100.0, Band::new("MODERATE", "#FFFF00")),
    (150.0, Band::new("UNHEALTHY", "#FF7E00")),
    (200.0, Band::new("UNHEALTHY", "#FF0000")),
    (300.0, Band::new("VERY UNHEALTHY", "#8F3F97")),
    (f64::INFINITY, Band::new("HAZARDOUS", "#7E0023")),
];

const UV_BANDS: &BandTable = &[
    (2.0, Band::new("LOW", "#39FF14")),
    (5.0, Band::new("MODERATE", "#FFFF00")),
    (7.0, Band::new("HIGH", "#FF7E00")),
    (10.0, Band::new("VERY HIGH", "#FF0000")),
    (f64::INFINITY, Band::new("EXTREME", "#8F3F97")),
];

const HUMIDITY_BANDS: &BandTable = &[
    (30.0, Band::new("LOW", "#3EC1EC")),
    (50.0, Band::new("NORMAL", "#39FF14")),
    (60.0, Band::new("SLIGHTLY HIGH", "#FFFF00")),
    (70.0, Band::new("HIGH", "#FF7E00")),
    (f64::INFINITY, Band::new("VERY HIGH", "#FF0000")),
];

fn band(table: &BandTable, value: Option<f64>) -> Band {
    match value {
        Some(v) if v >= 0.0 => table
            .iter()
            .find(|(upper, _)| v <= *upper)
            .map(|(_, band)| *band)
            .unwrap_or(Band::UNAVAILABLE),
        _ => Band::UNAVAILABLE,
    }
}

pub fn aqi_band(aqi: Option<f64>) -> Band {
    band(AQI_BANDS, aqi)
}

pub fn uv_band(uv: Option<f64>) -> Band {
    band(UV_BANDS, uv)
}

pub fn humidity_band(humidity: Option<f64>) -> Band {
    band(HUMIDITY_BANDS, humidity)
}
