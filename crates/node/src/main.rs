//! Virtual sensor node: synthesizes telemetry, encodes it into the gateway
//! uplink format, obfuscates it with the device key, and transmits it as
//! UDP datagrams on an interval. Stands in for real 868 MHz hardware during
//! development.

mod sim;
mod wire;

use std::{env, time::Duration};

use tokio::net::UdpSocket;
use tokio::time::sleep;

use sim::{Scenario, Simulator};
use wire::Payload;

fn hour_of_day() -> f64 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (secs % 86_400) as f64 / 3600.0
}

fn env_u32_hex(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    // Env config
    let gateway = env::var("GATEWAY_ADDR").unwrap_or_else(|_| "127.0.0.1:1700".to_string());
    let kind = env::var("NODE_KIND").unwrap_or_else(|_| "meteo".to_string());
    let serial = env_u32_hex("SERIAL", 0xABCDEF) & 0xFF_FFFF;
    let key = env_u32_hex("KEY", 0xDEADBEEF);
    let send_every_s: u64 = env::var("SEND_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);
    let scenario = Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_else(|_| "calm".to_string()),
    );

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to bind udp socket: {e}");
            return;
        }
    };

    eprintln!(
        "node up: kind={kind} serial={serial:x} scenario={scenario:?} -> {gateway} every {send_every_s}s"
    );

    let mut simulator = Simulator::new(scenario);

    loop {
        let reading = simulator.step(hour_of_day(), send_every_s as f64);

        let payload = match kind.as_str() {
            "bme280" => Payload::Bme280 {
                temp_c: reading.temp_c,
                pressure_hpa: reading.pressure_hpa,
                humidity_pct: reading.humidity_pct,
            },
            "scd40" => Payload::Scd40 {
                temp_c: reading.temp_c,
                co2_ppm: reading.co2_ppm,
                humidity_pct: reading.humidity_pct,
            },
            "veml7700" => Payload::Veml7700 { lux: reading.lux },
            "diy_temp" => Payload::DiyTemp {
                temp_c: reading.temp_c,
            },
            _ => Payload::Meteo {
                temp_c: reading.temp_c,
                pressure_hpa: reading.pressure_hpa,
                humidity_pct: reading.humidity_pct,
                wind_speed_ms: reading.wind_speed_ms,
                wind_direction_deg: reading.wind_direction_deg,
                rain_mm: reading.rain_mm,
                rain_rate_mmh: Some(reading.rain_rate_mmh),
            },
        };

        let frame = wire::obfuscate(&wire::build_frame(serial, reading.battery_mv, &payload), key);

        match socket.send_to(&frame, &gateway).await {
            Ok(sent) => eprintln!(
                "sent {sent} bytes: temp={:.2}C hum={:.1}% wind={:.1}m/s rain={:.2}mm bat={}mV",
                reading.temp_c,
                reading.humidity_pct,
                reading.wind_speed_ms,
                reading.rain_mm,
                reading.battery_mv
            ),
            Err(e) => eprintln!("send failed: {e}"),
        }

        sleep(Duration::from_secs(send_every_s)).await;
    }
}
