//! Per-device HTTP callback: expand `*TOKEN*` placeholders from the latest
//! calibrated reading and fire a GET. Fire-and-log; a failing endpoint never
//! slows ingestion down.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::device::{Device, Field, Measurement};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Only this much of a response body ever reaches the log.
const BODY_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardError {
    /// The endpoint answered outside 2xx.
    Status(u16),
    /// The request never completed (DNS, TCP, TLS, timeout).
    Transport(String),
}

impl fmt::Display for ForwardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "http callback answered {code}"),
            Self::Transport(e) => write!(f, "http callback failed: {e}"),
        }
    }
}

impl std::error::Error for ForwardError {}

// ---------------------------------------------------------------------------
// Template rendering
// ---------------------------------------------------------------------------

/// Substring-replace every placeholder the device's kind can actually fill.
/// Tokens for fields the kind does not carry stay verbatim, so a
/// mis-configured template is visible in the endpoint's access log.
pub fn render_url(device: &Device, m: &Measurement) -> String {
    let kind = device.kind;
    let mut url = device.url_template.clone();

    if kind.carries(Field::Temperature) {
        if let Some(v) = m.temperature {
            url = url.replace("*TEMP*", &format!("{v:.2}"));
        }
    }
    if kind.carries(Field::Humidity) {
        if let Some(v) = m.humidity {
            url = url.replace("*HUM*", &format!("{v:.2}"));
        }
    }
    if kind.carries(Field::Pressure) {
        if let Some(v) = m.pressure {
            url = url.replace("*PRESS*", &format!("{v:.2}"));
        }
    }
    if kind.carries(Field::Co2) {
        if let Some(v) = m.co2 {
            url = url.replace("*PPM*", &format!("{v:.0}"));
        }
    }
    if kind.carries(Field::Illuminance) {
        if let Some(v) = m.lux {
            url = url.replace("*LUX*", &format!("{v:.1}"));
        }
    }
    if kind.carries(Field::WindSpeed) {
        if let Some(v) = m.wind_speed {
            url = url.replace("*WIND_SPEED*", &format!("{v:.1}"));
        }
    }
    if kind.carries(Field::WindDirection) {
        if let Some(v) = m.wind_direction {
            url = url.replace("*WIND_DIR*", &v.to_string());
        }
    }
    if kind.carries(Field::RainAmount) {
        if let Some(v) = m.rain_amount {
            url = url.replace("*RAIN*", &format!("{v:.1}"));
        }
        url = url.replace("*DAILY_RAIN*", &format!("{:.1}", device.daily_rain_mm));
    }
    if kind.carries(Field::RainRate) {
        if let Some(v) = m.rain_rate {
            url = url.replace("*RAIN_RATE*", &format!("{v:.1}"));
        }
    }

    url = url.replace("*BAT*", &format!("{:.2}", m.battery_volts));
    url = url.replace("*RSSI*", &m.rssi_dbm.to_string());
    url = url.replace("*SN*", &device.serial_hex());
    url.replace("*TYPE*", &kind.wire_value().to_string())
}

/// Longest prefix of `s` within the log limit, kept on a char boundary.
fn body_excerpt(s: &str) -> &str {
    if s.len() <= BODY_LOG_LIMIT {
        return s;
    }
    let mut end = BODY_LOG_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new() -> Result<Self> {
        // Self-signed certificates are the norm on the hobbyist endpoints
        // these templates point at, matching the stock firmware's insecure
        // TLS client.
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }

    /// Render the device's template and GET it. A device without a template
    /// (or without a reading yet) is a successful no-op.
    pub async fn forward(&self, device: &Device) -> Result<(), ForwardError> {
        if device.url_template.is_empty() {
            return Ok(());
        }
        let Some(m) = device.last_reading else {
            return Ok(());
        };

        let url = render_url(device, &m);
        debug!(name = %device.name, url = %url, "forwarding reading");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        debug!(
            status = status.as_u16(),
            body = %body_excerpt(&body),
            "http callback delivered"
        );
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn bme280_device() -> Device {
        let mut d = Device::new(DeviceKind::Bme280, 0xABCDEF, 1, "clima".into());
        d.last_reading = Some(Measurement {
            temperature: Some(21.0),
            humidity: Some(43.2),
            pressure: Some(1000.0),
            battery_volts: 3.0,
            rssi_dbm: -71,
            ..Measurement::default()
        });
        d
    }

    fn meteo_device() -> Device {
        let mut d = Device::new(DeviceKind::Meteo, 0x31337, 1, "station".into());
        d.daily_rain_mm = 4.2;
        d.last_reading = Some(Measurement {
            temperature: Some(15.5),
            humidity: Some(72.0),
            pressure: Some(1015.0),
            wind_speed: Some(8.34),
            wind_direction: Some(270),
            rain_amount: Some(0.4),
            rain_rate: Some(2.5),
            battery_volts: 3.905,
            rssi_dbm: -98,
            ..Measurement::default()
        });
        d
    }

    // -- Token expansion ----------------------------------------------------

    #[test]
    fn expands_climate_tokens_with_two_decimals() {
        let mut d = bme280_device();
        d.url_template = "http://x/?t=*TEMP*&h=*HUM*&p=*PRESS*&b=*BAT*".into();
        let m = d.last_reading.unwrap();
        assert_eq!(
            render_url(&d, &m),
            "http://x/?t=21.00&h=43.20&p=1000.00&b=3.00"
        );
    }

    #[test]
    fn uncarried_token_stays_verbatim() {
        // BME280 has no CO2; *PPM* must survive untouched so the
        // misconfiguration shows up at the endpoint.
        let mut d = bme280_device();
        d.url_template = "https://x/y?t=*TEMP*&c=*PPM*".into();
        let m = d.last_reading.unwrap();
        assert_eq!(render_url(&d, &m), "https://x/y?t=21.00&c=*PPM*");
    }

    #[test]
    fn expands_meteo_tokens_with_single_decimal() {
        let mut d = meteo_device();
        d.url_template = "http://x/?ws=*WIND_SPEED*&wd=*WIND_DIR*&r=*RAIN*&dr=*DAILY_RAIN*&rr=*RAIN_RATE*".into();
        let m = d.last_reading.unwrap();
        assert_eq!(
            render_url(&d, &m),
            "http://x/?ws=8.3&wd=270&r=0.4&dr=4.2&rr=2.5"
        );
    }

    #[test]
    fn expands_identity_tokens_for_every_kind() {
        let mut d = bme280_device();
        d.url_template = "http://x/?sn=*SN*&type=*TYPE*&rssi=*RSSI*".into();
        let m = d.last_reading.unwrap();
        assert_eq!(render_url(&d, &m), "http://x/?sn=abcdef&type=1&rssi=-71");
    }

    #[test]
    fn diy_temp_type_renders_decimal() {
        let mut d = Device::new(DeviceKind::DiyTemp, 0x42, 1, "diy".into());
        d.url_template = "http://x/*TYPE*".into();
        let m = Measurement {
            temperature: Some(1.0),
            battery_volts: 3.0,
            ..Measurement::default()
        };
        assert_eq!(render_url(&d, &m), "http://x/81");
    }

    #[test]
    fn co2_renders_without_decimals() {
        let mut d = Device::new(DeviceKind::Scd40, 0x123, 1, "carbon".into());
        d.url_template = "http://x/?c=*PPM*".into();
        let m = Measurement {
            temperature: Some(20.0),
            humidity: Some(50.0),
            co2: Some(845.0),
            battery_volts: 2.9,
            ..Measurement::default()
        };
        assert_eq!(render_url(&d, &m), "http://x/?c=845");
    }

    #[test]
    fn repeated_tokens_all_expand() {
        let mut d = bme280_device();
        d.url_template = "http://x/?a=*TEMP*&b=*TEMP*".into();
        let m = d.last_reading.unwrap();
        assert_eq!(render_url(&d, &m), "http://x/?a=21.00&b=21.00");
    }

    #[test]
    fn template_without_tokens_is_untouched() {
        let mut d = bme280_device();
        d.url_template = "http://plain.example/ping".into();
        let m = d.last_reading.unwrap();
        assert_eq!(render_url(&d, &m), "http://plain.example/ping");
    }

    // -- Forward no-ops -----------------------------------------------------

    #[tokio::test]
    async fn empty_template_is_a_successful_noop() {
        let f = Forwarder::new().unwrap();
        let d = Device::new(DeviceKind::Bme280, 1, 1, "quiet".into());
        assert_eq!(f.forward(&d).await, Ok(()));
    }

    #[tokio::test]
    async fn device_without_a_reading_is_a_noop() {
        let f = Forwarder::new().unwrap();
        let mut d = Device::new(DeviceKind::Bme280, 1, 1, "fresh".into());
        d.url_template = "http://127.0.0.1:9/never".into();
        assert_eq!(f.forward(&d).await, Ok(()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_transport_error() {
        let f = Forwarder::new().unwrap();
        let mut d = bme280_device();
        // Port 9 (discard) is closed on any sane test host.
        d.url_template = "http://127.0.0.1:9/?t=*TEMP*".into();
        assert!(matches!(
            f.forward(&d).await,
            Err(ForwardError::Transport(_))
        ));
    }

    // -- Body excerpt -------------------------------------------------------

    #[test]
    fn short_bodies_pass_through() {
        assert_eq!(body_excerpt("ok"), "ok");
    }

    #[test]
    fn long_bodies_are_cut_at_100_bytes() {
        let body = "x".repeat(500);
        assert_eq!(body_excerpt(&body).len(), 100);
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        // 50 two-byte chars = 100 bytes; one more tips over the limit.
        let body = "é".repeat(51);
        let cut = body_excerpt(&body);
        assert!(cut.len() <= 100);
        assert_eq!(cut.chars().count(), 50);
    }
}
