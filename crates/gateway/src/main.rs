//! Gateway entry point: loads the persisted config and device registry,
//! brings up the radio, the MQTT session and the admin API, then hands
//! control to the ingestion loop.
//!
//! Operational guarantees:
//! - Only radio-init and registry-parse failures are fatal; everything the
//!   ingestion loop hits later is recovered locally
//! - MQTT reconnects are paced at 30 s, discovery republishes hourly
//! - Rain accumulators are persisted as they grow, so reboots don't lose
//!   the daily total
//! - SIGTERM/SIGINT → retained offline status + final registry persist

mod calibrate;
mod clock;
mod config;
mod device;
mod forward;
mod ingest;
mod mqtt;
mod protocol;
mod radio;
mod registry;
mod web;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::clock::SystemClock;
use crate::config::GatewayConfig;
use crate::forward::Forwarder;
use crate::ingest::Coordinator;
use crate::mqtt::MqttPublisher;
use crate::radio::Radio;
use crate::registry::Registry;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Persisted config ────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config = GatewayConfig::load(&config_path)?;

    // ── Structured logging (RUST_LOG overrides the persisted level) ─
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter().into()),
        )
        .init();

    info!(path = %config_path, "configuration loaded");
    let tz = config.resolved_timezone();
    info!(timezone = %tz, "rain-day rollover timezone");

    // ── Device registry ─────────────────────────────────────────────
    let devices_path = env::var("DEVICES_PATH").unwrap_or_else(|_| "sensors.json".to_string());
    let registry = Arc::new(Registry::new(&devices_path));
    registry.load().context("loading device registry")?;
    info!(count = registry.len(), "devices registered");

    // ── Radio ───────────────────────────────────────────────────────
    let mut radio = make_radio().await?;
    radio.init().await.context("radio init")?;

    // ── MQTT session ────────────────────────────────────────────────
    let (mqtt_client, eventloop) = mqtt::session(&config);
    let publisher = MqttPublisher::new(mqtt_client, &config);
    if config.mqtt_enabled {
        info!(host = %config.mqtt_host, port = config.mqtt_port, "mqtt fan-out enabled");
    } else {
        info!("mqtt fan-out disabled in configuration");
    }

    // ── Admin API ───────────────────────────────────────────────────
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(16);
    let web_state = AppState {
        registry: Arc::clone(&registry),
        events: event_tx,
    };
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!("admin api failed: {e:#}");
        }
    });

    // ── Ingestion loop ──────────────────────────────────────────────
    ingest::run(Coordinator {
        registry,
        radio,
        forwarder: Forwarder::new()?,
        publisher,
        eventloop,
        clock: Box::new(SystemClock),
        admin_events: event_rx,
        mqtt_enabled: config.mqtt_enabled,
        tz,
    })
    .await
}

#[cfg(feature = "hw")]
async fn make_radio() -> Result<Box<dyn Radio>> {
    let reset_gpio: u8 = env::var("LORA_RESET_GPIO")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);
    let dio0_gpio: u8 = env::var("LORA_DIO0_GPIO")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let sx = radio::Sx1276::open(reset_gpio, dio0_gpio).context("opening sx1276")?;
    Ok(Box::new(sx))
}

#[cfg(not(feature = "hw"))]
async fn make_radio() -> Result<Box<dyn Radio>> {
    let bind = env::var("RADIO_BIND").unwrap_or_else(|_| radio::DEFAULT_UDP_BIND.to_string());
    let udp = radio::UdpRadio::bind(&bind).await.context("binding udp radio")?;
    Ok(Box::new(udp))
}
