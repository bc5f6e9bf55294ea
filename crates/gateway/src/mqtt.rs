//! MQTT fan-out: the broker session options, non-retained per-field state
//! topics, and the retained Home Assistant discovery documents that have to
//! stay consistent with the device registry.

use std::time::Duration;

use mac_address::get_mac_address;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, Transport};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::device::{Device, Field, Measurement};

/// Reconnection attempts are spaced at least this far apart.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);
/// Discovery documents are re-published this often while connected.
pub const DISCOVERY_REPUBLISH_INTERVAL: Duration = Duration::from_secs(3600);
/// Home Assistant needs a moment to subscribe to the availability topic
/// after discovery, before status flips to online.
pub const STATUS_GRACE_DELAY: Duration = Duration::from_millis(500);

const MANUFACTURER: &str = "expLORA";

// ---------------------------------------------------------------------------
// Session setup
// ---------------------------------------------------------------------------

/// Client id derived from the host MAC, so reconnects resume the same broker
/// session.
pub fn client_id() -> String {
    match get_mac_address() {
        Ok(Some(mac)) => {
            let hex: String = mac.bytes().iter().map(|b| format!("{b:02x}")).collect();
            format!("explora-gw-{hex}")
        }
        _ => {
            warn!("could not read host MAC address, using fallback client id");
            "explora-gw-000000000000".to_string()
        }
    }
}

/// Build the broker session. The last will flips the retained status topic
/// to offline whenever the broker loses us.
pub fn session(config: &GatewayConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(client_id(), &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        format!("{}/status", config.mqtt_prefix),
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !config.mqtt_user.is_empty() {
        options.set_credentials(&config.mqtt_user, &config.mqtt_password);
    }
    if config.mqtt_tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    AsyncClient::new(options, 64)
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct MqttPublisher {
    client: AsyncClient,
    prefix: String,
    ha_prefix: String,
    ha_enabled: bool,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, config: &GatewayConfig) -> Self {
        Self {
            client,
            prefix: config.mqtt_prefix.clone(),
            ha_prefix: config.ha_prefix.clone(),
            ha_enabled: config.ha_enabled,
        }
    }

    /// Retained `{prefix}/status = online`, the counterpart of the last
    /// will.
    pub async fn announce_online(&self) {
        let topic = format!("{}/status", self.prefix);
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, true, "online")
            .await
        {
            warn!(topic = %topic, "status publish failed: {e}");
        }
    }

    /// Best-effort retained offline marker for clean shutdowns; the last
    /// will covers everything else.
    pub async fn announce_offline(&self) {
        let topic = format!("{}/status", self.prefix);
        let _ = self
            .client
            .publish(&topic, QoS::AtLeastOnce, true, "offline")
            .await;
    }

    /// Publish the device's latest reading across its per-field state
    /// topics. Non-retained; a missed value is simply superseded by the next
    /// uplink.
    pub async fn publish_state(&self, device: &Device) {
        let Some(m) = device.last_reading else {
            return;
        };
        for field in Field::ALL {
            if !device.kind.carries(field) {
                continue;
            }
            let Some(value) = state_value(device, &m, field) else {
                continue;
            };
            let topic = state_topic(&self.prefix, &device.serial_hex(), field);
            if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, false, value).await {
                warn!(topic = %topic, "state publish failed: {e}");
                return;
            }
        }
        debug!(name = %device.name, "published state topics");
    }

    /// Retained discovery documents for every field the device carries.
    pub async fn publish_discovery_for(&self, device: &Device) {
        if !self.ha_enabled {
            return;
        }
        for field in Field::ALL {
            if !device.kind.carries(field) {
                continue;
            }
            let topic = discovery_topic(&self.ha_prefix, &self.prefix, &device.serial_hex(), field);
            let doc = discovery_doc(&self.prefix, device, field);
            if let Err(e) = self
                .client
                .publish(&topic, QoS::AtLeastOnce, true, doc.to_string())
                .await
            {
                warn!(topic = %topic, "discovery publish failed: {e}");
                return;
            }
        }
        debug!(name = %device.name, "published discovery documents");
    }

    pub async fn publish_discovery_all(&self, devices: &[Device]) {
        if !self.ha_enabled {
            return;
        }
        for device in devices {
            self.publish_discovery_for(device).await;
        }
        info!(count = devices.len(), "home assistant discovery published");
    }

    /// Overwrite every possible discovery topic of the serial with an empty
    /// retained payload. Clearing a topic that never existed is a broker
    /// no-op, so all twelve fields are retracted regardless of kind.
    pub async fn retract_discovery(&self, serial: u32) {
        if !self.ha_enabled {
            return;
        }
        let serial_hex = format!("{serial:x}");
        info!(serial = %serial_hex, "retracting discovery documents");
        for topic in all_discovery_topics(&self.ha_prefix, &self.prefix, &serial_hex) {
            if let Err(e) = self.client.publish(&topic, QoS::AtLeastOnce, true, "").await {
                warn!(topic = %topic, "discovery retraction failed: {e}");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Topic grammar and document building
// ---------------------------------------------------------------------------

pub fn state_topic(prefix: &str, serial_hex: &str, field: Field) -> String {
    format!("{prefix}/{serial_hex}/{}", field.topic_name())
}

pub fn discovery_topic(ha_prefix: &str, prefix: &str, serial_hex: &str, field: Field) -> String {
    format!(
        "{ha_prefix}/sensor/{prefix}_{serial_hex}_{}/config",
        field.topic_name()
    )
}

pub fn all_discovery_topics(ha_prefix: &str, prefix: &str, serial_hex: &str) -> Vec<String> {
    Field::ALL
        .iter()
        .map(|&f| discovery_topic(ha_prefix, prefix, serial_hex, f))
        .collect()
}

/// State-topic payload for one field, with the wire precision each consumer
/// expects.
pub fn state_value(device: &Device, m: &Measurement, field: Field) -> Option<String> {
    Some(match field {
        Field::Temperature => format!("{:.2}", m.temperature?),
        Field::Humidity => format!("{:.2}", m.humidity?),
        Field::Pressure => format!("{:.2}", m.pressure?),
        Field::Co2 => format!("{:.0}", m.co2?),
        Field::Illuminance => format!("{:.1}", m.lux?),
        Field::WindSpeed => format!("{:.1}", m.wind_speed?),
        Field::WindDirection => m.wind_direction?.to_string(),
        Field::RainAmount => format!("{:.1}", m.rain_amount?),
        Field::DailyRain => format!("{:.1}", device.daily_rain_mm),
        Field::RainRate => format!("{:.1}", m.rain_rate?),
        Field::Battery => format!("{:.2}", m.battery_volts),
        Field::Rssi => m.rssi_dbm.to_string(),
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn device_class(field: Field) -> &'static str {
    match field {
        Field::Temperature => "temperature",
        Field::Humidity => "humidity",
        Field::Pressure => "pressure",
        Field::Co2 => "carbon_dioxide",
        Field::Illuminance => "illuminance",
        Field::WindSpeed => "wind_speed",
        Field::WindDirection => "wind_direction",
        Field::RainAmount | Field::DailyRain => "precipitation",
        Field::RainRate => "precipitation_intensity",
        Field::Battery => "voltage",
        Field::Rssi => "signal_strength",
    }
}

fn unit_of_measurement(field: Field) -> &'static str {
    match field {
        Field::Temperature => "°C",
        Field::Humidity => "%",
        Field::Pressure => "hPa",
        Field::Co2 => "ppm",
        Field::Illuminance => "lx",
        Field::WindSpeed => "m/s",
        Field::WindDirection => "°",
        Field::RainAmount | Field::DailyRain => "mm",
        Field::RainRate => "mm/h",
        Field::Battery => "V",
        Field::Rssi => "dBm",
    }
}

fn display_precision(field: Field) -> Option<u8> {
    match field {
        Field::Co2 | Field::WindDirection | Field::Rssi => None,
        Field::Battery => Some(2),
        _ => Some(1),
    }
}

/// One retained discovery document. The entity name repeats the device name
/// only when the user already baked the field into it; the daily-rain entity
/// always spells itself out.
pub fn discovery_doc(prefix: &str, device: &Device, field: Field) -> Value {
    let serial_hex = device.serial_hex();
    let field_name = field.topic_name();

    let name = if field == Field::DailyRain {
        format!("{} Daily Rain Total", device.name)
    } else if device.name.ends_with(&capitalize(field_name)) {
        device.name.clone()
    } else {
        capitalize(field_name)
    };

    let mut doc = json!({
        "name": name,
        "state_topic": state_topic(prefix, &serial_hex, field),
        "value_template": "{{ value }}",
        "unique_id": format!("{prefix}_{serial_hex}_{field_name}"),
        "availability_topic": format!("{prefix}/status"),
        "payload_available": "online",
        "payload_not_available": "offline",
        "device_class": device_class(field),
        "unit_of_measurement": unit_of_measurement(field),
        "device": {
            "identifiers": serial_hex,
            "name": device.name,
            "model": device.kind.model_name(),
            "manufacturer": MANUFACTURER,
        },
    });
    if let Some(precision) = display_precision(field) {
        doc["suggested_display_precision"] = json!(precision);
    }
    doc
}

// ===========================================================================
// Tests
// ===========================================================================
