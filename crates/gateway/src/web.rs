//! Admin JSON API: the external surface that creates, reconfigures and
//! deletes devices. Every mutation is relayed to the ingestion coordinator
//! over a channel so MQTT discovery follows the registry — re-published
//! after upserts, retracted on deletion.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::calibrate::Calibration;
use crate::device::{Device, DeviceKind};
use crate::registry::{DeviceConfig, Registry, RegistryError};

/// Registry mutations the coordinator reacts to on the MQTT side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminEvent {
    /// A device was created or reconfigured; discovery should be
    /// (re)published for this serial.
    Upserted(u32),
    /// A device is gone; its discovery documents must be retracted.
    Removed(u32),
}

// ---------------------------------------------------------------------------
// Composite app state shared across all handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub events: mpsc::Sender<AdminEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices).post(create_device))
        .route(
            "/api/devices/{serial}",
            axum::routing::put(update_device).delete(delete_device),
        )
        .with_state(state)
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices: Vec<Value> = state
        .registry
        .snapshot_active()
        .iter()
        .map(|(_, d)| device_json(d))
        .collect();
    Json(json!({ "sensors": devices }))
}

#[derive(Debug, Deserialize)]
struct CreateDevice {
    #[serde(rename = "deviceType")]
    device_type: u8,
    #[serde(rename = "serialNumber")]
    serial_number: u32,
    #[serde(rename = "deviceKey")]
    device_key: u32,
    name: String,
}

async fn create_device(
    State(state): State<AppState>,
    Json(body): Json<CreateDevice>,
) -> impl IntoResponse {
    let Some(kind) = DeviceKind::from_wire(body.device_type) else {
        return bad_request(format!("unknown device type {}", body.device_type));
    };
    if body.serial_number > 0xFF_FFFF {
        return bad_request("serial number exceeds 24 bits".to_string());
    }

    match state
        .registry
        .insert_or_update(kind, body.serial_number, body.device_key, &body.name)
    {
        Ok(_) => {
            persist_logged(&state.registry);
            notify(&state, AdminEvent::Upserted(body.serial_number)).await;
            (
                StatusCode::CREATED,
                Json(json!({ "serialNumber": format!("{:x}", body.serial_number) })),
            )
        }
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateDevice {
    name: String,
    #[serde(rename = "deviceType")]
    device_type: u8,
    #[serde(rename = "serialNumber")]
    serial_number: u32,
    #[serde(rename = "deviceKey")]
    device_key: u32,
    #[serde(rename = "customUrl", default)]
    custom_url: String,
    #[serde(default)]
    altitude: i32,
    #[serde(flatten)]
    calibration: Calibration,
}

async fn update_device(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    Json(body): Json<UpdateDevice>,
) -> impl IntoResponse {
    let Some(serial) = parse_serial(&serial) else {
        return bad_request(format!("invalid serial '{serial}'"));
    };
    let Some(handle) = state.registry.find_by_serial(serial) else {
        return registry_error(RegistryError::NoSuchDevice);
    };
    let Some(kind) = DeviceKind::from_wire(body.device_type) else {
        return bad_request(format!("unknown device type {}", body.device_type));
    };

    let result = state.registry.update_config(
        handle,
        DeviceConfig {
            name: body.name,
            kind,
            serial: body.serial_number,
            key: body.device_key,
            url_template: body.custom_url,
            altitude_m: body.altitude,
            calibration: body.calibration,
        },
    );

    match result {
        Ok(()) => {
            persist_logged(&state.registry);
            notify(&state, AdminEvent::Upserted(body.serial_number)).await;
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        Err(e) => registry_error(e),
    }
}

async fn delete_device(
    State(state): State<AppState>,
    Path(serial): Path<String>,
) -> impl IntoResponse {
    let Some(serial) = parse_serial(&serial) else {
        return bad_request(format!("invalid serial '{serial}'"));
    };
    let Some(handle) = state.registry.find_by_serial(serial) else {
        return registry_error(RegistryError::NoSuchDevice);
    };

    // Retraction goes out for the serial captured here; the registry only
    // forgets the device.
    notify(&state, AdminEvent::Removed(serial)).await;

    match state.registry.delete(handle) {
        Ok(_) => {
            persist_logged(&state.registry);
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        Err(e) => registry_error(e),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_serial(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 16).ok().filter(|&v| v <= 0xFF_FFFF)
}

fn device_json(d: &Device) -> Value {
    let mut doc = json!({
        "deviceType": d.kind.wire_value(),
        "typeName": d.kind.model_name(),
        "serialNumber": d.serial_hex(),
        "name": d.name,
        "customUrl": d.url_template,
        "altitude": d.altitude_m,
        "lastSeenSeconds": d.last_seen.map(|t| t.elapsed().as_secs()),
    });
    if let Some(m) = d.last_reading {
        let mut reading = serde_json::Map::new();
        if let Some(v) = m.temperature {
            reading.insert("temperature".into(), json!(v));
        }
        if let Some(v) = m.humidity {
            reading.insert("humidity".into(), json!(v));
        }
        if let Some(v) = m.pressure {
            reading.insert("pressure".into(), json!(v));
        }
        if let Some(v) = m.co2 {
            reading.insert("ppm".into(), json!(v));
        }
        if let Some(v) = m.lux {
            reading.insert("lux".into(), json!(v));
        }
        if let Some(v) = m.wind_speed {
            reading.insert("windSpeed".into(), json!(v));
        }
        if let Some(v) = m.wind_direction {
            reading.insert("windDirection".into(), json!(v));
        }
        if let Some(v) = m.rain_amount {
            reading.insert("rainAmount".into(), json!(v));
            reading.insert("dailyRainTotal".into(), json!(d.daily_rain_mm));
        }
        if let Some(v) = m.rain_rate {
            reading.insert("rainRate".into(), json!(v));
        }
        reading.insert("batteryVoltage".into(), json!(m.battery_volts));
        reading.insert("rssi".into(), json!(m.rssi_dbm));
        doc["reading"] = Value::Object(reading);
    }
    doc
}

fn persist_logged(registry: &Registry) {
    if let Err(e) = registry.persist() {
        error!("registry persist failed: {e:#}");
    }
}

async fn notify(state: &AppState, event: AdminEvent) {
    if state.events.send(event).await.is_err() {
        error!("coordinator is gone, dropping admin event {event:?}");
    }
}

fn bad_request(message: String) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn registry_error(e: RegistryError) -> (StatusCode, Json<Value>) {
    let status = match e {
        RegistryError::Full => StatusCode::INSUFFICIENT_STORAGE,
        RegistryError::SerialCollision => StatusCode::CONFLICT,
        RegistryError::NoSuchDevice => StatusCode::NOT_FOUND,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding admin api to {addr}"))?;
    info!("admin api listening on http://{addr}");
    axum::serve(listener, router(state))
        .await
        .context("admin api server error")
}

// ===========================================================================
// Tests
// ===========================================================================
