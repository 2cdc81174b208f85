//! ==============================================================================
//! air_quality.rs - time-indexed air-quality reference table
//! ==============================================================================
//!
//! purpose:
//!     the station has no particulate sensor on the bus. pollutant values come
//!     from a reference csv (hourly forecast/observation export) and the row
//!     whose timestamp is closest to "now" is used.
//!
//! file format:
//!     date,pm2_5,pm10,carbon_monoxide,nitrogen_dioxide,sulphur_dioxide,ozone,carbon_dioxide
//!     2024-06-01 14:00:00+05:00,41.2,88.0,310.0,22.1,9.4,61.0,420.0
//!
//!     offsets are dropped and the wall-clock time is kept, so the file is
//!     compared against local time as written.
//!
//! reload:
//!     the parsed table is cached and re-read when the file's modification
//!     time changes.
//!
//! a missing or empty file is "no air-quality data", never an error that
//! stops the cycle.
//!
//! ==============================================================================

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::ReferenceError;

/// pollutant concentrations for one reference row
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AirQuality {
    pub pm2_5: Option<f64>,
    pub pm10: Option<f64>,
    pub carbon_monoxide: Option<f64>,
    pub nitrogen_dioxide: Option<f64>,
    pub sulphur_dioxide: Option<f64>,
    pub ozone: Option<f64>,
    pub co2: Option<f64>,
}

// flat row: csv cannot deserialize typed fields through serde(flatten).
// an unparsable number (e.g. "N/A") reads as absent, the rest of the row is kept.
#[derive(Debug, Deserialize)]
struct Row {
    date: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pm2_5: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    pm10: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    carbon_monoxide: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    nitrogen_dioxide: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    sulphur_dioxide: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    ozone: Option<f64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    carbon_dioxide: Option<f64>,
}

impl Row {
    fn values(&self) -> AirQuality {
        AirQuality {
            pm2_5: self.pm2_5,
            pm10: self.pm10,
            carbon_monoxide: self.carbon_monoxide,
            nitrogen_dioxide: self.nitrogen_dioxide,
            sulphur_dioxide: self.sulphur_dioxide,
            ozone: self.ozone,
            co2: self.carbon_dioxide,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AirQualityTable {
    rows: Vec<(NaiveDateTime, AirQuality)>,
}

impl AirQualityTable {
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self, ReferenceError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut rows = Vec::new();
        for record in csv.deserialize::<Row>() {
            let row = record?;
            match parse_timestamp(&row.date) {
                Some(at) => rows.push((at, row.values())),
                None => tracing::debug!(date = %row.date, "skipping air-quality row with bad timestamp"),
            }
        }
        Ok(Self { rows })
    }

    pub fn load(path: &Path) -> Result<Self, ReferenceError> {
        let file = std::fs::File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReferenceError::Missing(path.display().to_string()),
            _ => ReferenceError::Io(e),
        })?;
        let table = Self::from_reader(file)?;
        if table.is_empty() {
            return Err(ReferenceError::Empty(path.display().to_string()));
        }
        Ok(table)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// row with the smallest absolute time difference; the earlier row wins a tie
    pub fn nearest(&self, at: NaiveDateTime) -> Option<&AirQuality> {
        self.rows
            .iter()
            .min_by_key(|(ts, _)| (*ts - at).num_seconds().unsigned_abs())
            .map(|(_, values)| values)
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.naive_local());
        }
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

// ==============================================================================
// cached source
// ==============================================================================

pub struct AirQualitySource {
    path: PathBuf,
    cached: Option<(SystemTime, AirQualityTable)>,
    reported_unavailable: bool,
}

impl AirQualitySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cached: None, reported_unavailable: false }
    }

    fn needs_reload(&self, modified: SystemTime) -> bool {
        match &self.cached {
            Some((loaded_at, _)) => modified != *loaded_at,
            None => true,
        }
    }

    /// reference row closest to `at`, or None when the file is unusable
    pub fn lookup(&mut self, at: NaiveDateTime) -> Option<AirQuality> {
        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => {
                self.cached = None;
                self.report_unavailable(&ReferenceError::Missing(self.path.display().to_string()));
                return None;
            }
        };

        if self.needs_reload(modified) {
            match AirQualityTable::load(&self.path) {
                Ok(table) => {
                    tracing::info!(path = %self.path.display(), rows = table.rows.len(), "air-quality table loaded");
                    self.cached = Some((modified, table));
                    self.reported_unavailable = false;
                }
                Err(e) => {
                    self.cached = None;
                    self.report_unavailable(&e);
                    return None;
                }
            }
        }

        self.cached.as_ref().and_then(|(_, table)| table.nearest(at).cloned())
    }

    // the loop polls every second; only the first failure in a row is logged
    fn report_unavailable(&mut self, error: &ReferenceError) {
        if !self.reported_unavailable {
            tracing::warn!(error = %error, "no air-quality data");
            self.reported_unavailable = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const TABLE: &str = "\
date,pm2_5,pm10,carbon_monoxide,nitrogen_dioxide,sulphur_dioxide,ozone,carbon_dioxide
2024-06-01 12:00:00+05:00,30.0,60.0,300.0,20.0,9.0,55.0,410.0
2024-06-01 13:00:00+05:00,35.0,70.0,310.0,21.0,9.5,60.0,415.0
not-a-date,1.0,1.0,1.0,1.0,1.0,1.0,1.0
2024-06-01T14:00:00,40.0,,320.0,22.0,10.0,65.0,420.0
";

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn nearest_row_by_absolute_difference() {
        let table = AirQualityTable::from_reader(TABLE.as_bytes()).unwrap();
        assert_eq!(table.nearest(at(12, 20)).unwrap().pm2_5, Some(30.0));
        assert_eq!(table.nearest(at(12, 40)).unwrap().pm2_5, Some(35.0));
        // far past / far future clamp to the ends
        assert_eq!(table.nearest(at(1, 0)).unwrap().pm2_5, Some(30.0));
        assert_eq!(table.nearest(at(23, 0)).unwrap().pm2_5, Some(40.0));
    }

    #[test]
    fn tie_prefers_earlier_row() {
        let table = AirQualityTable::from_reader(TABLE.as_bytes()).unwrap();
        assert_eq!(table.nearest(at(12, 30)).unwrap().pm2_5, Some(30.0));
    }

    #[test]
    fn bad_timestamps_skipped_and_blank_cells_absent() {
        let table = AirQualityTable::from_reader(TABLE.as_bytes()).unwrap();
        assert_eq!(table.rows.len(), 3);
        let last = table.nearest(at(14, 0)).unwrap();
        assert_eq!(last.pm10, None);
        assert_eq!(last.co2, Some(420.0));
    }

    #[test]
    fn unparsable_cell_is_absent_and_row_kept() {
        let table = AirQualityTable::from_reader(
            "date,pm2_5,pm10\n2024-06-01 12:00:00,30.0,60.0\n2024-06-01 13:00:00,N/A,71.0\n".as_bytes(),
        )
        .unwrap();
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.nearest(at(12, 0)).unwrap().pm2_5, Some(30.0));
        let bad = table.nearest(at(13, 0)).unwrap();
        assert_eq!(bad.pm2_5, None);
        assert_eq!(bad.pm10, Some(71.0));
    }

    #[test]
    fn offset_is_dropped_keeping_wall_clock() {
        assert_eq!(parse_timestamp("2024-06-01 13:00:00+05:00"), Some(at(13, 0)));
        assert_eq!(parse_timestamp("2024-06-01T13:00:00+05:00"), Some(at(13, 0)));
        assert_eq!(parse_timestamp("2024-06-01 13:00"), Some(at(13, 0)));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn missing_and_empty_files_yield_no_data() {
        let dir = std::env::temp_dir().join(format!("aq-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut missing = AirQualitySource::new(dir.join("nope.csv"));
        assert_eq!(missing.lookup(at(12, 0)), None);

        let empty_path = dir.join("empty.csv");
        std::fs::write(&empty_path, "date,pm2_5\n").unwrap();
        let mut empty = AirQualitySource::new(&empty_path);
        assert_eq!(empty.lookup(at(12, 0)), None);

        let full_path = dir.join("full.csv");
        std::fs::write(&full_path, TABLE).unwrap();
        let mut full = AirQualitySource::new(&full_path);
        assert_eq!(full.lookup(at(13, 5)).unwrap().pm2_5, Some(35.0));

        std::fs::remove_dir_all(&dir).ok();
    }

    fn touch_later(path: &Path, secs: u64) {
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + std::time::Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn rewritten_file_is_reloaded() {
        let dir = std::env::temp_dir().join(format!("aq-reload-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("aqi_reference.csv");

        std::fs::write(&path, "date,pm2_5\n2024-06-01 12:00:00,30.0\n").unwrap();
        let mut source = AirQualitySource::new(&path);
        assert_eq!(source.lookup(at(12, 0)).unwrap().pm2_5, Some(30.0));

        // unchanged mtime: cached table still served
        assert_eq!(source.lookup(at(12, 0)).unwrap().pm2_5, Some(30.0));

        std::fs::write(&path, "date,pm2_5\n2024-06-01 12:00:00,55.5\n").unwrap();
        touch_later(&path, 60);
        assert_eq!(source.lookup(at(12, 0)).unwrap().pm2_5, Some(55.5));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_appearing_later_is_picked_up() {
        let dir = std::env::temp_dir().join(format!("aq-late-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("aqi_reference.csv");

        let mut source = AirQualitySource::new(&path);
        assert_eq!(source.lookup(at(12, 0)), None);
        assert_eq!(source.lookup(at(12, 0)), None);

        std::fs::write(&path, "date,pm2_5\n2024-06-01 12:00:00,8.0\n").unwrap();
        assert_eq!(source.lookup(at(12, 0)).unwrap().pm2_5, Some(8.0));

        std::fs::remove_dir_all(&dir).ok();
    }
}
