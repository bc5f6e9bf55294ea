//! Per-device calibration: additive/multiplicative corrections, sea-level
//! pressure conversion, and the daily-rain rollover decision.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::device::Measurement;

// ---------------------------------------------------------------------------
// Calibration record
// ---------------------------------------------------------------------------

/// Per-field corrections. Offsets are added, multipliers scale; the identity
/// record (all offsets 0, all multipliers 1) is the default and what a
/// registry document without correction keys loads as.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(rename = "temperatureCorrection", default)]
    pub temperature_offset: f32,
    #[serde(rename = "humidityCorrection", default)]
    pub humidity_offset: f32,
    #[serde(rename = "pressureCorrection", default)]
    pub pressure_offset: f32,
    #[serde(rename = "ppmCorrection", default)]
    pub co2_offset: f32,
    #[serde(rename = "luxCorrection", default)]
    pub lux_offset: f32,
    #[serde(rename = "windSpeedCorrection", default = "unity")]
    pub wind_speed_multiplier: f32,
    /// Degrees added to the reported wind direction before wrapping to
    /// 0..=359.
    #[serde(rename = "windDirectionCorrection", default)]
    pub wind_direction_offset: i32,
    #[serde(rename = "rainAmountCorrection", default = "unity")]
    pub rain_amount_multiplier: f32,
    #[serde(rename = "rainRateCorrection", default = "unity")]
    pub rain_rate_multiplier: f32,
}

fn unity() -> f32 {
    1.0
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            temperature_offset: 0.0,
            humidity_offset: 0.0,
            pressure_offset: 0.0,
            co2_offset: 0.0,
            lux_offset: 0.0,
            wind_speed_multiplier: 1.0,
            wind_direction_offset: 0,
            rain_amount_multiplier: 1.0,
            rain_rate_multiplier: 1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Apply corrections to a raw decoded measurement. Pressure is corrected by
/// its offset first, then converted from station-relative to sea-level when
/// the device sits above 0 m; the conversion uses the corrected temperature.
pub fn apply(raw: &Measurement, cal: &Calibration, altitude_m: i32) -> Measurement {
    let mut m = *raw;

    m.temperature = raw.temperature.map(|v| v + cal.temperature_offset);
    m.humidity = raw.humidity.map(|v| v + cal.humidity_offset);
    m.co2 = raw.co2.map(|v| v + cal.co2_offset);
    m.lux = raw.lux.map(|v| v + cal.lux_offset);
    m.wind_speed = raw.wind_speed.map(|v| v * cal.wind_speed_multiplier);
    m.wind_direction = raw
        .wind_direction
        .map(|v| wrap_direction(v, cal.wind_direction_offset));
    m.rain_amount = raw.rain_amount.map(|v| v * cal.rain_amount_multiplier);
    m.rain_rate = raw.rain_rate.map(|v| v * cal.rain_rate_multiplier);

    m.pressure = raw.pressure.map(|v| {
        let corrected = v + cal.pressure_offset;
        match m.temperature {
            Some(t) if altitude_m > 0 => sea_level_pressure(corrected, altitude_m, t),
            _ => corrected,
        }
    });

    m
}

/// `(raw + offset) mod 360`, always landing in 0..=359.
pub fn wrap_direction(raw: u16, offset: i32) -> u16 {
    (raw as i32 + offset).rem_euclid(360) as u16
}

// Barometric constants for the relative-to-absolute conversion.
const G: f64 = 9.80665; // gravitational acceleration [m/s^2]
const M: f64 = 0.028_964_4; // molar mass of air [kg/mol]
const R: f64 = 8.314_459_8; // universal gas constant [J/(mol*K)]
const L: f64 = 0.0065; // temperature lapse rate [K/m]

/// Convert station-relative pressure to the sea-level equivalent using the
/// barometric formula. Altitude 0 passes the value through.
pub fn sea_level_pressure(p_rel_hpa: f32, altitude_m: i32, temp_c: f32) -> f32 {
    if altitude_m == 0 {
        return p_rel_hpa;
    }
    let t = temp_c as f64 + 273.15;
    let exponent = (G * M) / (R * L);
    (p_rel_hpa as f64 / (1.0 - (L * altitude_m as f64) / t).powf(exponent)) as f32
}

// ---------------------------------------------------------------------------
// Rain-day rollover
// ---------------------------------------------------------------------------

/// Whether the daily-rain accumulator must reset before adding this packet's
/// rain: true when the wall clock is available and the local calendar date
/// has moved past the date of the last reset (or no reset was ever
/// recorded). With no wall clock the accumulator keeps growing and the
/// rollover waits for time sync.
pub fn rain_day_rolled(
    last_reset: Option<DateTime<Utc>>,
    now: Option<DateTime<Tz>>,
    tz: Tz,
) -> bool {
    let Some(now) = now else {
        return false;
    };
    match last_reset {
        None => true,
        Some(prev) => prev.with_timezone(&tz).date_naive() != now.date_naive(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
