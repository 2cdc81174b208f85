//! Sunrise/sunset almanac keyed by month-day.
//!
//! The file is a small csv (`date,sunrise,sunset` with `MM-DD` and `HH:MM`
//! cells) for the station's location. Anything missing falls back to the
//! configured defaults, so consumers always get a pair of times.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ReferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SunTimes {
    #[serde(serialize_with = "hh_mm")]
    pub sunrise: NaiveTime,
    #[serde(serialize_with = "hh_mm")]
    pub sunset: NaiveTime,
}

fn hh_mm<S: serde::Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format("%H:%M"))
}

#[derive(Debug, Deserialize)]
struct Row {
    date: String,
    sunrise: String,
    sunset: String,
}

#[derive(Debug, Clone)]
pub struct SunAlmanac {
    entries: HashMap<String, SunTimes>,
    defaults: SunTimes,
}

pub fn parse_clock(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

impl SunAlmanac {
    pub fn empty(defaults: SunTimes) -> Self {
        Self { entries: HashMap::new(), defaults }
    }

    pub fn from_reader<R: std::io::Read>(reader: R, defaults: SunTimes) -> Result<Self, ReferenceError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut entries = HashMap::new();
        for record in csv.deserialize::<Row>() {
            let row = record?;
            if let (Some(sunrise), Some(sunset)) = (parse_clock(&row.sunrise), parse_clock(&row.sunset)) {
                entries.insert(row.date, SunTimes { sunrise, sunset });
            }
        }
        Ok(Self { entries, defaults })
    }

    /// load the almanac, falling back to defaults-only when the file is unusable
    pub fn load_or_defaults(path: &Path, defaults: SunTimes) -> Self {
        let loaded = std::fs::File::open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ReferenceError::Missing(path.display().to_string()),
                _ => ReferenceError::Io(e),
            })
            .and_then(|file| Self::from_reader(file, defaults));

        match loaded {
            Ok(almanac) => {
                tracing::info!(path = %path.display(), days = almanac.entries.len(), "sun almanac loaded");
                almanac
            }
            Err(e) => {
                tracing::warn!(error = %e, "sun almanac unavailable, using default times");
                Self::empty(defaults)
            }
        }
    }

    pub fn lookup(&self, date: NaiveDate) -> SunTimes {
        let key = format!("{:02}-{:02}", date.month(), date.day());
        match self.entries.get(&key) {
            Some(times) => *times,
            None => {
                tracing::debug!(date = %key, "no sun data for date, using defaults");
                self.defaults
            }
        }
    }

    /// sunrise <= now < sunset
    pub fn is_daytime(&self, now: NaiveDateTime) -> bool {
        let times = self.lookup(now.date());
        times.sunrise <= now.time() && now.time() < times.sunset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> SunTimes {
        SunTimes {
            sunrise: parse_clock("06:00").unwrap(),
            sunset: parse_clock("18:00").unwrap(),
        }
    }

    const ALMANAC: &str = "date,sunrise,sunset\n06-21,05:42,19:21\n12-21,07:16,17:34\n01-01,bad,17:50\n";

    #[test]
    fn lookup_by_month_day() {
        let almanac = SunAlmanac::from_reader(ALMANAC.as_bytes(), defaults()).unwrap();
        let times = almanac.lookup(NaiveDate::from_ymd_opt(2025, 6, 21).unwrap());
        assert_eq!(times.sunrise, parse_clock("05:42").unwrap());
        assert_eq!(times.sunset, parse_clock("19:21").unwrap());
    }

    #[test]
    fn missing_or_bad_row_uses_defaults() {
        let almanac = SunAlmanac::from_reader(ALMANAC.as_bytes(), defaults()).unwrap();
        assert_eq!(almanac.lookup(NaiveDate::from_ymd_opt(2025, 3, 3).unwrap()), defaults());
        assert_eq!(almanac.lookup(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()), defaults());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let almanac = SunAlmanac::load_or_defaults(Path::new("/nonexistent/sun.csv"), defaults());
        assert_eq!(almanac.lookup(NaiveDate::from_ymd_opt(2025, 6, 21).unwrap()), defaults());
    }

    #[test]
    fn daytime_window_is_half_open() {
        let almanac = SunAlmanac::empty(defaults());
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(almanac.is_daytime(day.and_hms_opt(6, 0, 0).unwrap()));
        assert!(almanac.is_daytime(day.and_hms_opt(17, 59, 59).unwrap()));
        assert!(!almanac.is_daytime(day.and_hms_opt(18, 0, 0).unwrap()));
        assert!(!almanac.is_daytime(day.and_hms_opt(5, 59, 0).unwrap()));
    }

    #[test]
    fn times_serialize_as_clock() {
        let json = serde_json::to_string(&defaults()).unwrap();
        assert_eq!(json, r#"{"sunrise":"06:00","sunset":"18:00"}"#);
    }
}
