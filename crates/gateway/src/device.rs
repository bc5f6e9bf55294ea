//! Device model: sensor kinds, their field capabilities, and the measurement
//! record the decoder produces.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::calibrate::Calibration;

// ---------------------------------------------------------------------------
// Device kinds
// ---------------------------------------------------------------------------

/// Wire-level device kind. The discriminant is the byte carried at offset 1
/// of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceKind {
    /// Temperature / humidity / pressure climate sensor.
    Bme280 = 0x01,
    /// Temperature / humidity / CO2 sensor.
    Scd40 = 0x02,
    /// Meteorological station (wind + rain on top of climate).
    Meteo = 0x03,
    /// Ambient light sensor.
    Veml7700 = 0x04,
    /// DIY temperature-only node.
    DiyTemp = 0x51,
}

impl DeviceKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Bme280),
            0x02 => Some(Self::Scd40),
            0x03 => Some(Self::Meteo),
            0x04 => Some(Self::Veml7700),
            0x51 => Some(Self::DiyTemp),
            _ => None,
        }
    }

    pub fn wire_value(self) -> u8 {
        self as u8
    }

    /// Model name used in the Home Assistant device block.
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Bme280 => "CLIMA",
            Self::Scd40 => "CARBON",
            Self::Meteo => "METEO",
            Self::Veml7700 => "VEML7700",
            Self::DiyTemp => "DIY TEMP",
        }
    }

    /// Whether this kind reports the given field. Battery and RSSI come with
    /// every uplink; the rest follow the sensor hardware.
    pub fn carries(self, field: Field) -> bool {
        use Field::*;
        match field {
            Battery | Rssi => true,
            Temperature => !matches!(self, Self::Veml7700),
            Humidity => matches!(self, Self::Bme280 | Self::Scd40 | Self::Meteo),
            Pressure => matches!(self, Self::Bme280 | Self::Meteo),
            Co2 => matches!(self, Self::Scd40),
            Illuminance => matches!(self, Self::Veml7700),
            WindSpeed | WindDirection => matches!(self, Self::Meteo),
            RainAmount | DailyRain | RainRate => matches!(self, Self::Meteo),
        }
    }
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// One publishable measurement field. The order here is the order state and
/// discovery topics are published in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Temperature,
    Humidity,
    Pressure,
    Co2,
    Illuminance,
    WindSpeed,
    WindDirection,
    RainAmount,
    DailyRain,
    RainRate,
    Battery,
    Rssi,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::Temperature,
        Field::Humidity,
        Field::Pressure,
        Field::Co2,
        Field::Illuminance,
        Field::WindSpeed,
        Field::WindDirection,
        Field::RainAmount,
        Field::DailyRain,
        Field::RainRate,
        Field::Battery,
        Field::Rssi,
    ];

    /// Topic segment / discovery id segment for this field.
    pub fn topic_name(self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::Pressure => "pressure",
            Field::Co2 => "co2",
            Field::Illuminance => "illuminance",
            Field::WindSpeed => "wind_speed",
            Field::WindDirection => "wind_direction",
            Field::RainAmount => "rain_amount",
            Field::DailyRain => "daily_rain",
            Field::RainRate => "rain_rate",
            Field::Battery => "battery",
            Field::Rssi => "rssi",
        }
    }
}

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// One decoded uplink. Only the fields the originating kind carries are
/// populated; absent is distinct from zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub pressure: Option<f32>,
    pub co2: Option<f32>,
    pub lux: Option<f32>,
    pub wind_speed: Option<f32>,
    pub wind_direction: Option<u16>,
    pub rain_amount: Option<f32>,
    pub rain_rate: Option<f32>,
    pub battery_volts: f32,
    pub rssi_dbm: i16,
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// One registered sensor device: identity, routing config, calibration, and
/// the latest observed state.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub kind: DeviceKind,
    /// 24-bit serial number; unique across the registry.
    pub serial: u32,
    /// 32-bit shared obfuscation key.
    pub key: u32,
    pub name: String,
    /// HTTP callback URL with `*TOKEN*` placeholders; empty disables HTTP
    /// fan-out.
    pub url_template: String,
    /// Metres above sea level, for relative-to-absolute pressure conversion.
    pub altitude_m: i32,
    pub calibration: Calibration,
    pub last_reading: Option<Measurement>,
    pub last_seen: Option<Instant>,
    /// Rain accumulated since the last local-midnight rollover (mm).
    pub daily_rain_mm: f32,
    pub last_rain_reset: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(kind: DeviceKind, serial: u32, key: u32, name: String) -> Self {
        Self {
            kind,
            serial,
            key,
            name,
            url_template: String::new(),
            altitude_m: 0,
            calibration: Calibration::default(),
            last_reading: None,
            last_seen: None,
            daily_rain_mm: 0.0,
            last_rain_reset: None,
        }
    }

    /// Serial as it appears in topics and URL templates: lowercase hex, no
    /// prefix, no padding.
    pub fn serial_hex(&self) -> String {
        format!("{:x}", self.serial)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- DeviceKind ---------------------------------------------------------

    #[test]
    fn from_wire_roundtrips_all_kinds() {
        for kind in [
            DeviceKind::Bme280,
            DeviceKind::Scd40,
            DeviceKind::Meteo,
            DeviceKind::Veml7700,
            DeviceKind::DiyTemp,
        ] {
            assert_eq!(DeviceKind::from_wire(kind.wire_value()), Some(kind));
        }
    }

    #[test]
    fn from_wire_rejects_unknown_values() {
        assert_eq!(DeviceKind::from_wire(0x00), None);
        assert_eq!(DeviceKind::from_wire(0x05), None);
        assert_eq!(DeviceKind::from_wire(0xFF), None);
    }

    #[test]
    fn diy_temp_uses_the_extended_code() {
        assert_eq!(DeviceKind::DiyTemp.wire_value(), 0x51);
    }

    // -- Capabilities -------------------------------------------------------

    #[test]
    fn bme280_carries_climate_fields_only() {
        let k = DeviceKind::Bme280;
        assert!(k.carries(Field::Temperature));
        assert!(k.carries(Field::Humidity));
        assert!(k.carries(Field::Pressure));
        assert!(!k.carries(Field::Co2));
        assert!(!k.carries(Field::Illuminance));
        assert!(!k.carries(Field::WindSpeed));
        assert!(!k.carries(Field::RainAmount));
    }

    #[test]
    fn scd40_swaps_pressure_for_co2() {
        let k = DeviceKind::Scd40;
        assert!(k.carries(Field::Co2));
        assert!(!k.carries(Field::Pressure));
    }

    #[test]
    fn meteo_carries_wind_and_rain() {
        let k = DeviceKind::Meteo;
        for f in [
            Field::Temperature,
            Field::Humidity,
            Field::Pressure,
            Field::WindSpeed,
            Field::WindDirection,
            Field::RainAmount,
            Field::DailyRain,
            Field::RainRate,
        ] {
            assert!(k.carries(f), "meteo should carry {f:?}");
        }
    }

    #[test]
    fn veml7700_is_light_only() {
        let k = DeviceKind::Veml7700;
        assert!(k.carries(Field::Illuminance));
        assert!(!k.carries(Field::Temperature));
        assert!(!k.carries(Field::Humidity));
    }

    #[test]
    fn every_kind_carries_battery_and_rssi() {
        for kind in [
            DeviceKind::Bme280,
            DeviceKind::Scd40,
            DeviceKind::Meteo,
            DeviceKind::Veml7700,
            DeviceKind::DiyTemp,
        ] {
            assert!(kind.carries(Field::Battery));
            assert!(kind.carries(Field::Rssi));
        }
    }

    // -- Device helpers -----------------------------------------------------

    #[test]
    fn serial_hex_is_lowercase_without_prefix() {
        let d = Device::new(DeviceKind::Bme280, 0xABCDEF, 1, "t".into());
        assert_eq!(d.serial_hex(), "abcdef");
    }

    #[test]
    fn new_device_has_no_reading_and_identity_calibration() {
        let d = Device::new(DeviceKind::Meteo, 1, 2, "m".into());
        assert!(d.last_reading.is_none());
        assert!(d.last_seen.is_none());
        assert_eq!(d.daily_rain_mm, 0.0);
        assert_eq!(d.calibration, Calibration::default());
    }
}
