//! Ingestion coordinator: one cooperative loop pumping frames through
//! decode → calibrate → store → fan-out, while also driving the MQTT
//! session (reconnect pacing, hourly discovery republish) and reacting to
//! admin mutations. Fan-out failures never stall reception.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono_tz::Tz;
use rumqttc::{Event, EventLoop, Packet};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::device::Device;
use crate::forward::Forwarder;
use crate::mqtt::{
    MqttPublisher, DISCOVERY_REPUBLISH_INTERVAL, RECONNECT_INTERVAL, STATUS_GRACE_DELAY,
};
use crate::protocol::{self, DecodeError, DecodeOutcome};
use crate::radio::{Radio, ReceivedFrame};
use crate::registry::Registry;
use crate::web::AdminEvent;

/// Back-off after a radio backend fault before polling it again.
const RADIO_FAULT_BACKOFF: Duration = Duration::from_millis(250);

pub struct Coordinator {
    pub registry: Arc<Registry>,
    pub radio: Box<dyn Radio>,
    pub forwarder: Forwarder,
    pub publisher: MqttPublisher,
    pub eventloop: EventLoop,
    pub clock: Box<dyn Clock>,
    pub admin_events: mpsc::Receiver<AdminEvent>,
    pub mqtt_enabled: bool,
    pub tz: Tz,
}

pub async fn run(coordinator: Coordinator) -> Result<()> {
    let Coordinator {
        registry,
        mut radio,
        forwarder,
        publisher,
        mut eventloop,
        clock,
        mut admin_events,
        mqtt_enabled,
        tz,
    } = coordinator;

    let mut mqtt_connected = false;
    // Earliest moment the MQTT event loop may be polled again; pushed out
    // 30 s on every session error so reconnects never hammer the broker.
    let mut mqtt_gate = tokio::time::Instant::now();
    let mut admin_open = true;

    let mut discovery_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + DISCOVERY_REPUBLISH_INTERVAL,
        DISCOVERY_REPUBLISH_INTERVAL,
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    info!(mqtt_enabled, "ingestion loop started");
    let exit_reason: &str;

    loop {
        tokio::select! {
            maybe_frame = radio.receive() => {
                match maybe_frame {
                    Some(frame) => {
                        handle_frame(
                            frame,
                            &registry,
                            &forwarder,
                            &publisher,
                            clock.as_ref(),
                            tz,
                            mqtt_enabled && mqtt_connected,
                        )
                        .await;
                    }
                    None => {
                        warn!("radio backend fault, resetting");
                        if let Err(e) = radio.reset().await {
                            error!("radio reset failed: {e}");
                        }
                        tokio::time::sleep(RADIO_FAULT_BACKOFF).await;
                    }
                }
            }

            event = eventloop.poll(), if mqtt_enabled && tokio::time::Instant::now() >= mqtt_gate => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        mqtt_connected = true;
                        // Give the broker time to fan the session out before
                        // availability flips, then re-seed discovery.
                        tokio::time::sleep(STATUS_GRACE_DELAY).await;
                        publisher.announce_online().await;
                        publisher.publish_discovery_all(&active_devices(&registry)).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected by broker");
                        mqtt_connected = false;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(
                            "mqtt session error: {e}, retrying in {}s",
                            RECONNECT_INTERVAL.as_secs()
                        );
                        mqtt_connected = false;
                        mqtt_gate = tokio::time::Instant::now() + RECONNECT_INTERVAL;
                    }
                }
            }

            // Wakes the loop when the reconnect window reopens; the poll arm
            // above takes over from there.
            _ = tokio::time::sleep_until(mqtt_gate),
                if mqtt_enabled && tokio::time::Instant::now() < mqtt_gate => {}

            _ = discovery_tick.tick() => {
                if mqtt_enabled && mqtt_connected {
                    debug!("hourly discovery republish");
                    publisher.publish_discovery_all(&active_devices(&registry)).await;
                }
            }

            maybe_event = admin_events.recv(), if admin_open => {
                match maybe_event {
                    Some(event) => {
                        handle_admin_event(event, &registry, &publisher, mqtt_enabled && mqtt_connected)
                            .await;
                    }
                    None => admin_open = false,
                }
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // Reverse dependency order on the way out: flip availability, then make
    // sure the rain accumulators survive the restart.
    warn!(signal = exit_reason, "shutting down");
    if mqtt_enabled && mqtt_connected {
        publisher.announce_offline().await;
    }
    if let Err(e) = registry.persist() {
        error!("final registry persist failed: {e:#}");
    }
    info!("shutdown complete");
    Ok(())
}

fn active_devices(registry: &Registry) -> Vec<Device> {
    registry
        .snapshot_active()
        .into_iter()
        .map(|(_, d)| d)
        .collect()
}

// ---------------------------------------------------------------------------
// Frame lifecycle: RawFrame -> (Unknown | Rejected | Matched -> Stored -> fan-out)
// ---------------------------------------------------------------------------

async fn handle_frame(
    frame: ReceivedFrame,
    registry: &Registry,
    forwarder: &Forwarder,
    publisher: &MqttPublisher,
    clock: &dyn Clock,
    tz: Tz,
    publish_mqtt: bool,
) {
    debug!(
        len = frame.bytes.len(),
        rssi = frame.rssi_dbm,
        snr = frame.snr_db,
        "frame received: {}",
        protocol::hex_dump(&frame.bytes)
    );

    let candidates = registry.snapshot_active();
    match protocol::try_decode(&frame.bytes, &candidates) {
        Ok(DecodeOutcome::Unknown) => {
            debug!("unknown sensor, dropping frame");
        }
        Err(e @ (DecodeError::TooShort(_) | DecodeError::TooLong(_))) => {
            debug!("dropping frame: {e}");
        }
        Err(e) => {
            warn!("dropping frame: {e}");
        }
        Ok(DecodeOutcome::Matched {
            handle,
            measurement,
        }) => {
            let wall = clock.wall().map(|t| t.with_timezone(&tz));
            let Some(stored) =
                registry.apply_reading(handle, measurement, frame.rssi_dbm, Instant::now(), wall)
            else {
                warn!("device deleted mid-frame, dropping reading");
                return;
            };
            let Some(device) = registry.get(handle) else {
                return;
            };

            info!(
                name = %device.name,
                serial = %device.serial_hex(),
                rssi = stored.rssi_dbm,
                "reading stored"
            );

            // Store happened above; both fan-outs are fire-and-log.
            if !device.url_template.is_empty() {
                if let Err(e) = forwarder.forward(&device).await {
                    warn!(name = %device.name, "http fan-out failed: {e}");
                }
            }
            if publish_mqtt {
                publisher.publish_state(&device).await;
            }

            // Rain accumulators are the only reading-derived state that must
            // survive a reboot.
            if stored.rain_amount.unwrap_or(0.0) > 0.0 {
                if let Err(e) = registry.persist() {
                    error!("registry persist after rain failed: {e:#}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Admin relay: keep retained discovery in step with the registry
// ---------------------------------------------------------------------------

async fn handle_admin_event(
    event: AdminEvent,
    registry: &Registry,
    publisher: &MqttPublisher,
    connected: bool,
) {
    if !connected {
        // Discovery is re-seeded wholesale on the next connect.
        debug!(?event, "mqtt offline, deferring discovery update");
        return;
    }
    match event {
        AdminEvent::Upserted(serial) => {
            if let Some(device) = registry.find_by_serial(serial).and_then(|h| registry.get(h)) {
                publisher.publish_discovery_for(&device).await;
            }
        }
        AdminEvent::Removed(serial) => {
            publisher.retract_discovery(serial).await;
        }
    }
}
