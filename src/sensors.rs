//! ==============================================================================
//! sensors.rs - endpoint registry and register decoders
//! ==============================================================================
//!
//! purpose:
//!     turns raw holding-register blocks into typed physical values, one
//!     decoder per sensor class. the decoders are pure; `read_endpoint` glues
//!     a decoder to a bus read and applies the fallback policy.
//!
//! register maps (all read from the endpoint's start address):
//!     environment     3 regs  temperature, humidity, pressure  (each raw / 10)
//!     uv              1 reg   uv index                         (raw / 100)
//!     wind speed      1 reg   m/s                              (raw / 10)
//!     wind direction  3 regs  avg(reg0, reg2) / 10 -> degrees  (reg1 unused)
//!     rainfall        1 reg   cumulative gauge mm              (raw / 10)
//!
//! fallback policy on a failed read:
//!     uv, wind speed                 -> 0.0
//!     environment, direction, rain   -> no reading (a zero would be a lie)
//!
//! ==============================================================================

use std::fmt;

use crate::bus::{BusClient, Transport};

/// 16-point compass, clockwise from north
pub const COMPASS_POINTS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE",
    "S", "SSW", "SW", "WSW", "W", "WNW", "NW", "NNW",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Environment,
    Uv,
    WindSpeed,
    WindDirection,
    Rainfall,
}

impl SensorKind {
    /// registers read per poll
    pub fn register_count(self) -> u16 {
        match self {
            SensorKind::Environment | SensorKind::WindDirection => 3,
            SensorKind::Uv | SensorKind::WindSpeed | SensorKind::Rainfall => 1,
        }
    }

    /// value substituted when the endpoint cannot be read
    pub fn fallback(self) -> Option<Reading> {
        match self {
            SensorKind::Uv => Some(Reading::Uv(0.0)),
            SensorKind::WindSpeed => Some(Reading::WindSpeed(0.0)),
            SensorKind::Environment | SensorKind::WindDirection | SensorKind::Rainfall => None,
        }
    }
}

/// one logical sensor on the shared bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub kind: SensorKind,
    pub unit: u8,
    pub address: u16,
    pub count: u16,
}

impl Endpoint {
    pub fn new(name: &'static str, kind: SensorKind, unit: u8, address: u16) -> Self {
        Self { name, kind, unit, address, count: kind.register_count() }
    }
}

/// static name -> endpoint mapping, built once at startup
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Environment { temperature: f64, humidity: f64, pressure: f64 },
    Uv(f64),
    WindSpeed(f64),
    WindDirection { degrees: u16, cardinal: &'static str },
    /// cumulative gauge value, not a per-interval delta
    Rainfall(f64),
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Environment { temperature, humidity, pressure } => {
                write!(f, "Env: {temperature:.1}°C, {humidity:.1}%, {pressure:.1}hPa")
            }
            Reading::Uv(uv) => write!(f, "UV: {uv:.2}"),
            Reading::WindSpeed(speed) => write!(f, "Wind Speed: {speed:.1} m/s"),
            Reading::WindDirection { degrees, cardinal } => {
                write!(f, "Wind Direction: {degrees}° ({cardinal})")
            }
            Reading::Rainfall(mm) => write!(f, "Raw Rainfall Reading: {mm:.1} mm"),
        }
    }
}

// ==============================================================================
// decoders
// ==============================================================================

pub fn decode_environment(registers: &[u16]) -> Option<Reading> {
    match registers {
        [t, h, p, ..] => Some(Reading::Environment {
            temperature: f64::from(*t) / 10.0,
            humidity: f64::from(*h) / 10.0,
            pressure: f64::from(*p) / 10.0,
        }),
        _ => None,
    }
}

pub fn decode_uv(registers: &[u16]) -> Option<Reading> {
    registers.first().map(|raw| Reading::Uv(f64::from(*raw) / 100.0))
}

pub fn decode_wind_speed(registers: &[u16]) -> Option<Reading> {
    registers.first().map(|raw| Reading::WindSpeed(f64::from(*raw) / 10.0))
}

/// average of the first and third register; the middle one is not used.
/// ties in the final rounding go to the even degree. anything outside
/// [0, 360] is rejected rather than wrapped.
pub fn decode_wind_direction(registers: &[u16]) -> Option<Reading> {
    let [first, _, third, ..] = registers else {
        return None;
    };
    let average = (f64::from(*first) + f64::from(*third)) / 2.0;
    let degrees = (average / 10.0).round_ties_even();
    if !(0.0..=360.0).contains(&degrees) {
        return None;
    }
    let degrees = degrees as u16;
    Some(Reading::WindDirection { degrees, cardinal: cardinal(f64::from(degrees)) })
}

pub fn decode_rainfall(registers: &[u16]) -> Option<Reading> {
    registers.first().map(|raw| Reading::Rainfall(f64::from(*raw) / 10.0))
}

/// nearest of the 16 compass points. `degrees / 22.5` is rounded half away
/// from zero, so 11.25° is NNE and 348.75° wraps to N.
pub fn cardinal(degrees: f64) -> &'static str {
    let index = (degrees / 22.5).round().rem_euclid(16.0) as usize;
    COMPASS_POINTS[index % 16]
}

pub fn decode(kind: SensorKind, registers: &[u16]) -> Option<Reading> {
    match kind {
        SensorKind::Environment => decode_environment(registers),
        SensorKind::Uv => decode_uv(registers),
        SensorKind::WindSpeed => decode_wind_speed(registers),
        SensorKind::WindDirection => decode_wind_direction(registers),
        SensorKind::Rainfall => decode_rainfall(registers),
    }
}

// ==============================================================================
// reader
// ==============================================================================

/// poll one endpoint. failures are logged here and never escape.
pub async fn read_endpoint<T: Transport>(bus: &mut BusClient<T>, endpoint: &Endpoint) -> Option<Reading> {
    match bus.read(endpoint.unit, endpoint.address, endpoint.count).await {
        Ok(block) => {
            let reading = decode(endpoint.kind, &block);
            if reading.is_none() {
                tracing::warn!(endpoint = endpoint.name, registers = ?&*block, "value out of range, no reading");
            }
            reading
        }
        Err(e) => {
            tracing::warn!(endpoint = endpoint.name, unit = endpoint.unit, error = %e, "sensor read failed");
            endpoint.kind.fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeTransport;
    use crate::error::BusError;
    use std::time::Duration;

    #[test]
    fn environment_scales_by_ten() {
        assert_eq!(
            decode_environment(&[253, 612, 10087]),
            Some(Reading::Environment { temperature: 25.3, humidity: 61.2, pressure: 1008.7 })
        );
        assert_eq!(decode_environment(&[253, 612]), None);
    }

    #[test]
    fn single_register_scales() {
        assert_eq!(decode_uv(&[734]), Some(Reading::Uv(7.34)));
        assert_eq!(decode_wind_speed(&[45]), Some(Reading::WindSpeed(4.5)));
        assert_eq!(decode_rainfall(&[1023]), Some(Reading::Rainfall(102.3)));
    }

    #[test]
    fn wind_direction_ignores_middle_register() {
        let reading = decode_wind_direction(&[1800, 9999, 1820]).unwrap();
        assert_eq!(reading, Reading::WindDirection { degrees: 181, cardinal: "S" });
    }

    #[test]
    fn wind_direction_ties_round_to_even() {
        // avg 1805 -> 180.5 -> 180
        assert_eq!(
            decode_wind_direction(&[1800, 0, 1810]),
            Some(Reading::WindDirection { degrees: 180, cardinal: "S" })
        );
        // avg 1815 -> 181.5 -> 182
        assert_eq!(
            decode_wind_direction(&[1810, 0, 1820]),
            Some(Reading::WindDirection { degrees: 182, cardinal: "S" })
        );
    }

    #[test]
    fn wind_direction_out_of_range_is_no_reading() {
        assert_eq!(decode_wind_direction(&[3700, 0, 3700]), None);
        // 360.4 rounds to 360 and is kept
        assert_eq!(
            decode_wind_direction(&[3604, 0, 3604]),
            Some(Reading::WindDirection { degrees: 360, cardinal: "N" })
        );
        // 360.6 rounds to 361 and is rejected, not wrapped
        assert_eq!(decode_wind_direction(&[3606, 0, 3606]), None);
    }

    #[test]
    fn cardinal_points() {
        assert_eq!(cardinal(0.0), "N");
        assert_eq!(cardinal(22.5), "NNE");
        assert_eq!(cardinal(11.25), "NNE");
        assert_eq!(cardinal(11.0), "N");
        assert_eq!(cardinal(90.0), "E");
        assert_eq!(cardinal(180.0), "S");
        assert_eq!(cardinal(326.0), "NW");
        assert_eq!(cardinal(348.75), "N");
        assert_eq!(cardinal(359.0), "N");
        assert_eq!(cardinal(360.0), "N");
    }

    #[test]
    fn fallback_policy() {
        assert_eq!(SensorKind::Uv.fallback(), Some(Reading::Uv(0.0)));
        assert_eq!(SensorKind::WindSpeed.fallback(), Some(Reading::WindSpeed(0.0)));
        assert_eq!(SensorKind::Environment.fallback(), None);
        assert_eq!(SensorKind::WindDirection.fallback(), None);
        assert_eq!(SensorKind::Rainfall.fallback(), None);
    }

    #[tokio::test]
    async fn failed_read_uses_fallback() {
        let transport = FakeTransport::new();
        transport.respond(2, Err(BusError::Exception("GatewayTargetDevice".into())));
        let mut bus = BusClient::new(transport.clone(), Duration::from_millis(50));

        let uv = Endpoint::new("uv", SensorKind::Uv, 2, 0);
        assert_eq!(read_endpoint(&mut bus, &uv).await, Some(Reading::Uv(0.0)));

        let rain = Endpoint::new("rainfall", SensorKind::Rainfall, 6, 0);
        assert_eq!(read_endpoint(&mut bus, &rain).await, None);
    }

    #[test]
    fn reading_display() {
        let reading = Reading::WindDirection { degrees: 326, cardinal: "NW" };
        assert_eq!(reading.to_string(), "Wind Direction: 326° (NW)");
    }
}
