//! ==============================================================================
//! snapshot.rs - per-cycle snapshot and its hand-off to consumers
//! ==============================================================================
//!
//! purpose:
//!     one Snapshot is built per acquisition cycle from whichever readers
//!     succeeded, then published whole. consumers only ever see a complete
//!     snapshot: publishing swaps an Arc, it never edits fields in place.
//!
//! sharing model:
//!
//!     acquisition loop --publish(Arc<Snapshot>)--> watch channel --latest()--> web api
//!                      --push(Snapshot)----------> snapshot queue -----------> persistence
//!
//!     readers clone the Arc and drop the channel borrow immediately, so no
//!     lock is ever held across i/o.
//!
//! ==============================================================================

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Local>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub uv_index: Option<f64>,
    /// m/s
    pub wind_speed: Option<f64>,
    pub wind_dir_degrees: Option<u16>,
    pub wind_dir_cardinal: Option<&'static str>,
    /// raw cumulative gauge reading, mm
    pub rainfall: Option<f64>,
    /// accumulated since local midnight, mm
    pub rainfall_daily: Option<f64>,
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub co2: Option<f64>,
    pub carbon_monoxide: Option<f64>,
    pub nitrogen_dioxide: Option<f64>,
    pub sulphur_dioxide: Option<f64>,
    pub ozone: Option<f64>,
    pub aqi: Option<f64>,
}

impl Snapshot {
    /// a snapshot with every metric absent
    pub fn empty(captured_at: DateTime<Local>) -> Self {
        Self {
            captured_at,
            temperature: None,
            humidity: None,
            pressure: None,
            uv_index: None,
            wind_speed: None,
            wind_dir_degrees: None,
            wind_dir_cardinal: None,
            rainfall: None,
            rainfall_daily: None,
            pm2_5: None,
            pm10: None,
            co2: None,
            carbon_monoxide: None,
            nitrogen_dioxide: None,
            sulphur_dioxide: None,
            ozone: None,
            aqi: None,
        }
    }
}

// ==============================================================================
// metric table
// ==============================================================================
// every persisted column is listed here once. order == csv column order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Timestamp,
    Temperature,
    Humidity,
    Pressure,
    UvIndex,
    Co2,
    Pm2_5,
    Pm10,
    CarbonMonoxide,
    NitrogenDioxide,
    SulphurDioxide,
    Ozone,
    WindSpeed,
    WindDirDegrees,
    WindDirCardinal,
    Rainfall,
    RainfallDaily,
    Aqi,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Degrees(u16),
    Text(String),
}

impl Metric {
    pub const ALL: [Metric; 18] = [
        Metric::Timestamp,
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::UvIndex,
        Metric::Co2,
        Metric::Pm2_5,
        Metric::Pm10,
        Metric::CarbonMonoxide,
        Metric::NitrogenDioxide,
        Metric::SulphurDioxide,
        Metric::Ozone,
        Metric::WindSpeed,
        Metric::WindDirDegrees,
        Metric::WindDirCardinal,
        Metric::Rainfall,
        Metric::RainfallDaily,
        Metric::Aqi,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Timestamp => "timestamp",
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::UvIndex => "uv_index",
            Metric::Co2 => "co2",
            Metric::Pm2_5 => "pm2_5",
            Metric::Pm10 => "pm10",
            Metric::CarbonMonoxide => "carbon_monoxide",
            Metric::NitrogenDioxide => "nitrogen_dioxide",
            Metric::SulphurDioxide => "sulphur_dioxide",
            Metric::Ozone => "ozone",
            Metric::WindSpeed => "wind_speed",
            Metric::WindDirDegrees => "wind_dir_degrees",
            Metric::WindDirCardinal => "wind_dir_cardinal",
            Metric::Rainfall => "rainfall",
            Metric::RainfallDaily => "rainfall_daily",
            Metric::Aqi => "aqi",
        }
    }

    pub fn value(self, snapshot: &Snapshot) -> Option<MetricValue> {
        let number = |v: Option<f64>| v.map(MetricValue::Number);
        match self {
            Metric::Timestamp => Some(MetricValue::Text(
                snapshot.captured_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            )),
            Metric::Temperature => number(snapshot.temperature),
            Metric::Humidity => number(snapshot.humidity),
            Metric::Pressure => number(snapshot.pressure),
            Metric::UvIndex => number(snapshot.uv_index),
            Metric::Co2 => number(snapshot.co2),
            Metric::Pm2_5 => number(snapshot.pm2_5),
            Metric::Pm10 => number(snapshot.pm10),
            Metric::CarbonMonoxide => number(snapshot.carbon_monoxide),
            Metric::NitrogenDioxide => number(snapshot.nitrogen_dioxide),
            Metric::SulphurDioxide => number(snapshot.sulphur_dioxide),
            Metric::Ozone => number(snapshot.ozone),
            Metric::WindSpeed => number(snapshot.wind_speed),
            Metric::WindDirDegrees => snapshot.wind_dir_degrees.map(MetricValue::Degrees),
            Metric::WindDirCardinal => snapshot.wind_dir_cardinal.map(|c| MetricValue::Text(c.to_string())),
            Metric::Rainfall => number(snapshot.rainfall),
            Metric::RainfallDaily => number(snapshot.rainfall_daily),
            Metric::Aqi => number(snapshot.aqi),
        }
    }

    /// csv cell text; an absent value is an empty cell
    pub fn csv_cell(self, snapshot: &Snapshot) -> String {
        match self.value(snapshot) {
            None => String::new(),
            Some(MetricValue::Number(v)) => match self {
                Metric::Aqi => format!("{v:.0}"),
                Metric::RainfallDaily => format!("{v:.1}"),
                _ => v.to_string(),
            },
            Some(MetricValue::Degrees(d)) => d.to_string(),
            Some(MetricValue::Text(t)) => t,
        }
    }

    pub fn header() -> Vec<&'static str> {
        Metric::ALL.iter().map(|m| m.name()).collect()
    }

    pub fn row(snapshot: &Snapshot) -> Vec<String> {
        Metric::ALL.iter().map(|m| m.csv_cell(snapshot)).collect()
    }
}

// ==============================================================================
// publication
// ==============================================================================

/// single writer side; owned by the acquisition loop
pub struct SnapshotPublisher {
    tx: watch::Sender<Option<Arc<Snapshot>>>,
}

/// cheap, cloneable read side for live consumers
#[derive(Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Option<Arc<Snapshot>>>,
}

pub fn channel() -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(None);
    (SnapshotPublisher { tx }, SnapshotReader { rx })
}

impl SnapshotPublisher {
    /// replace the current snapshot in one step
    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        self.tx.send_replace(Some(snapshot));
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.tx.borrow().clone()
    }
}

impl SnapshotReader {
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.rx.borrow().clone()
    }
}
