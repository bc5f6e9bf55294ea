//! The device registry: the single piece of mutable state shared between the
//! ingestion loop and the admin surface. One mutex guards a fixed array of
//! 20 slots; reads take cheap snapshots, every mutation holds the lock for
//! its full duration, and nothing awaits while holding it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibrate::{self, Calibration};
use crate::device::{Device, DeviceKind, Measurement};

/// Fixed registry capacity. A design invariant, not a tunable: the trial
/// decryption cost per frame is bounded by it.
pub const MAX_DEVICES: usize = 20;

// ---------------------------------------------------------------------------
// Handles and errors
// ---------------------------------------------------------------------------

/// Stable identifier of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// All 20 slots are occupied.
    Full,
    /// The requested serial is already owned by another device.
    SerialCollision,
    /// The handle no longer points at a configured device.
    NoSuchDevice,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "registry full ({MAX_DEVICES} devices)"),
            Self::SerialCollision => write!(f, "serial number already in use"),
            Self::NoSuchDevice => write!(f, "no such device"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Everything the admin surface can change about a device in one atomic
/// update.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub serial: u32,
    pub key: u32,
    pub url_template: String,
    pub altitude_m: i32,
    pub calibration: Calibration,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    slots: Mutex<[Option<Device>; MAX_DEVICES]>,
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            slots: Mutex::new(std::array::from_fn(|_| None)),
            path: path.into(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, [Option<Device>; MAX_DEVICES]> {
        self.slots.lock().expect("registry mutex poisoned")
    }

    /// Create a device, or overwrite kind/key/name of the device already
    /// owning the serial. Routing config and calibration of an existing
    /// device are left alone.
    pub fn insert_or_update(
        &self,
        kind: DeviceKind,
        serial: u32,
        key: u32,
        name: &str,
    ) -> Result<DeviceHandle, RegistryError> {
        let mut slots = self.locked();

        if let Some(i) = index_of_serial(&slots, serial) {
            let device = slots[i].as_mut().expect("indexed slot is occupied");
            device.kind = kind;
            device.key = key;
            device.name = name.to_string();
            info!(serial = %format!("{serial:x}"), name, "updated existing device");
            return Ok(DeviceHandle(i));
        }

        let Some(free) = slots.iter().position(Option::is_none) else {
            return Err(RegistryError::Full);
        };
        slots[free] = Some(Device::new(kind, serial, key, name.to_string()));
        info!(serial = %format!("{serial:x}"), name, slot = free, "registered new device");
        Ok(DeviceHandle(free))
    }

    /// Atomically replace a device's full configuration. Fails when the new
    /// serial is owned by a different slot.
    pub fn update_config(
        &self,
        handle: DeviceHandle,
        config: DeviceConfig,
    ) -> Result<(), RegistryError> {
        let mut slots = self.locked();

        if let Some(owner) = index_of_serial(&slots, config.serial) {
            if owner != handle.0 {
                return Err(RegistryError::SerialCollision);
            }
        }

        let device = slots
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(RegistryError::NoSuchDevice)?;

        device.name = config.name;
        device.kind = config.kind;
        device.serial = config.serial;
        device.key = config.key;
        device.url_template = config.url_template;
        device.altitude_m = config.altitude_m;
        device.calibration = config.calibration;
        info!(serial = %device.serial_hex(), name = %device.name, "device configuration updated");
        Ok(())
    }

    /// Free the slot and return the removed device. The caller retracts the
    /// device's MQTT discovery documents; the registry only forgets it.
    pub fn delete(&self, handle: DeviceHandle) -> Result<Device, RegistryError> {
        let mut slots = self.locked();
        let device = slots
            .get_mut(handle.0)
            .and_then(Option::take)
            .ok_or(RegistryError::NoSuchDevice)?;
        info!(serial = %device.serial_hex(), name = %device.name, "device deleted");
        Ok(device)
    }

    /// Copy of every configured device, in slot order, paired with its
    /// handle. This is the candidate list the trial decryption walks.
    pub fn snapshot_active(&self) -> Vec<(DeviceHandle, Device)> {
        self.locked()
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|d| (DeviceHandle(i), d.clone())))
            .collect()
    }

    pub fn find_by_serial(&self, serial: u32) -> Option<DeviceHandle> {
        index_of_serial(&self.locked(), serial).map(DeviceHandle)
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<Device> {
        self.locked().get(handle.0).and_then(Option::clone)
    }

    pub fn len(&self) -> usize {
        self.locked().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calibrate a decoded measurement against the device's corrections,
    /// run the daily-rain rollover, and store the result as the device's
    /// latest reading. Returns the calibrated measurement, or `None` when
    /// the handle went stale between decode and store.
    pub fn apply_reading(
        &self,
        handle: DeviceHandle,
        raw: Measurement,
        rssi_dbm: i16,
        now: Instant,
        wall: Option<DateTime<Tz>>,
    ) -> Option<Measurement> {
        let mut slots = self.locked();
        let device = slots.get_mut(handle.0).and_then(Option::as_mut)?;

        let mut m = calibrate::apply(&raw, &device.calibration, device.altitude_m);
        m.rssi_dbm = rssi_dbm;

        if let Some(rain) = m.rain_amount {
            if let Some(w) = wall {
                if calibrate::rain_day_rolled(device.last_rain_reset, Some(w), w.timezone()) {
                    info!(name = %device.name, "daily rain total reset at local midnight");
                    device.daily_rain_mm = 0.0;
                    device.last_rain_reset = Some(w.with_timezone(&Utc));
                }
            }
            device.daily_rain_mm += rain;
        }

        device.last_seen = Some(now);
        device.last_reading = Some(m);
        Some(m)
    }

    // -- Persistence --------------------------------------------------------

    /// Write the registry document. Errors are the caller's to log; a later
    /// successful persist supersedes a failed one.
    pub fn persist(&self) -> Result<()> {
        let doc = RegistryDoc {
            sensors: self
                .locked()
                .iter()
                .flatten()
                .map(DeviceRecord::from_device)
                .collect(),
        };
        let json = serde_json::to_string_pretty(&doc).context("serializing device registry")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("writing device registry to {}", self.path.display()))?;
        info!(count = doc.sensors.len(), path = %self.path.display(), "device registry saved");
        Ok(())
    }

    /// Restore devices from the registry document. A missing file is an
    /// empty registry, not an error.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no device registry file, starting empty");
            return Ok(());
        }
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading device registry from {}", self.path.display()))?;
        let doc: RegistryDoc =
            serde_json::from_str(&json).context("parsing device registry document")?;

        let mut slots = self.locked();
        *slots = std::array::from_fn(|_| None);

        let mut loaded = 0usize;
        for record in doc.sensors {
            let Some(kind) = DeviceKind::from_wire(record.device_type) else {
                warn!(
                    device_type = record.device_type,
                    serial = %format!("{:x}", record.serial_number),
                    "skipping device with unknown kind"
                );
                continue;
            };
            if loaded >= MAX_DEVICES {
                warn!("too many devices in registry file, ignoring the rest");
                break;
            }
            slots[loaded] = Some(record.into_device(kind));
            loaded += 1;
        }
        info!(count = loaded, "device registry loaded");
        Ok(())
    }
}

fn index_of_serial(slots: &[Option<Device>; MAX_DEVICES], serial: u32) -> Option<usize> {
    slots
        .iter()
        .position(|s| s.as_ref().is_some_and(|d| d.serial == serial))
}

// ---------------------------------------------------------------------------
// Persisted document
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    sensors: Vec<DeviceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceRecord {
    #[serde(rename = "deviceType")]
    device_type: u8,
    #[serde(rename = "serialNumber")]
    serial_number: u32,
    #[serde(rename = "deviceKey")]
    device_key: u32,
    name: String,
    #[serde(rename = "customUrl", default)]
    custom_url: String,
    #[serde(default)]
    altitude: i32,
    #[serde(
        rename = "dailyRainTotal",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    daily_rain_total: Option<f32>,
    #[serde(
        rename = "lastRainReset",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    last_rain_reset: Option<i64>,
    #[serde(flatten)]
    calibration: Calibration,
}

impl DeviceRecord {
    fn from_device(device: &Device) -> Self {
        let rains = device.kind.carries(crate::device::Field::RainAmount);
        Self {
            device_type: device.kind.wire_value(),
            serial_number: device.serial,
            device_key: device.key,
            name: device.name.clone(),
            custom_url: device.url_template.clone(),
            altitude: device.altitude_m,
            daily_rain_total: rains.then_some(device.daily_rain_mm),
            last_rain_reset: device
                .last_rain_reset
                .filter(|_| rains)
                .map(|t| t.timestamp()),
            calibration: device.calibration,
        }
    }

    fn into_device(self, kind: DeviceKind) -> Device {
        let mut device = Device::new(kind, self.serial_number, self.device_key, self.name);
        device.url_template = self.custom_url;
        device.altitude_m = self.altitude;
        device.calibration = self.calibration;
        device.daily_rain_mm = self.daily_rain_total.unwrap_or(0.0);
        device.last_rain_reset = self
            .last_rain_reset
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        device
    }
}

// ===========================================================================
// Tests
// ===========================================================================
