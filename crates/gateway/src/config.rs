//! Persisted gateway configuration: one JSON document with the key set the
//! stock firmware writes. Unknown keys are ignored, absent keys take
//! defaults, and the file not existing at all is just a default config.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_MQTT_PREFIX: &str = "explora";
pub const DEFAULT_HA_PREFIX: &str = "homeassistant";
/// Central European Time with automatic DST, as the firmware ships it.
pub const DEFAULT_TIMEZONE: &str = "CET-1CEST,M3.5.0,M10.5.0/3";

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    // WiFi/AP lifecycle lives outside this daemon; the keys round-trip so an
    // edited document never loses them.
    pub ssid: String,
    pub password: String,
    #[serde(rename = "configMode")]
    pub config_mode: bool,
    #[serde(rename = "logLevel")]
    pub log_level: String,
    pub timezone: String,
    #[serde(rename = "mqttHost")]
    pub mqtt_host: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    pub mqtt_user: String,
    #[serde(rename = "mqttPassword")]
    pub mqtt_password: String,
    #[serde(rename = "mqttEnabled")]
    pub mqtt_enabled: bool,
    #[serde(rename = "mqttTls")]
    pub mqtt_tls: bool,
    #[serde(rename = "mqttPrefix")]
    pub mqtt_prefix: String,
    #[serde(rename = "mqttHAEnabled")]
    pub ha_enabled: bool,
    #[serde(rename = "mqttHAPrefix")]
    pub ha_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            config_mode: true,
            log_level: "INFO".to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            mqtt_enabled: false,
            mqtt_tls: false,
            mqtt_prefix: DEFAULT_MQTT_PREFIX.to_string(),
            ha_enabled: true,
            ha_prefix: DEFAULT_HA_PREFIX.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&json).context("parsing config document")?;
        Ok(config)
    }

    /// Resolve the configured timezone. IANA names parse directly; the
    /// firmware's stock POSIX string maps to its IANA equivalent; anything
    /// else warns and falls back to UTC.
    pub fn resolved_timezone(&self) -> Tz {
        if let Ok(tz) = Tz::from_str(&self.timezone) {
            return tz;
        }
        if self.timezone.starts_with("CET-1CEST") {
            return chrono_tz::Europe::Prague;
        }
        warn!(timezone = %self.timezone, "unrecognized timezone, falling back to UTC");
        Tz::UTC
    }

    /// Default tracing filter derived from the persisted log level;
    /// `RUST_LOG` still wins when set.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" | "VERBOSE" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" => "error",
            _ => "info",
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
