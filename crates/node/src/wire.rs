//! Uplink wire format: header, per-kind payload words, XOR checksum, and
//! the key-derived obfuscation stream. This is the sensor side of the
//! protocol; the gateway holds the matching decoder.

/// Magic/version byte at offset 0.
pub const MAGIC: u8 = 0x42;

pub const KIND_BME280: u8 = 0x01;
pub const KIND_SCD40: u8 = 0x02;
pub const KIND_METEO: u8 = 0x03;
pub const KIND_VEML7700: u8 = 0x04;
pub const KIND_DIY_TEMP: u8 = 0x51;

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Measurement payload in physical units; encoding scales to the wire's
/// fixed-point words.
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    Bme280 {
        temp_c: f32,
        pressure_hpa: f32,
        humidity_pct: f32,
    },
    Scd40 {
        temp_c: f32,
        co2_ppm: u16,
        humidity_pct: f32,
    },
    Veml7700 {
        lux: f32,
    },
    Meteo {
        temp_c: f32,
        pressure_hpa: f32,
        humidity_pct: f32,
        wind_speed_ms: f32,
        wind_direction_deg: u16,
        rain_mm: f32,
        /// The extended 23-byte frame; `None` sends the plain 21-byte form.
        rain_rate_mmh: Option<f32>,
    },
    DiyTemp {
        temp_c: f32,
    },
}

impl Payload {
    pub fn kind_code(&self) -> u8 {
        match self {
            Payload::Bme280 { .. } => KIND_BME280,
            Payload::Scd40 { .. } => KIND_SCD40,
            Payload::Veml7700 { .. } => KIND_VEML7700,
            Payload::Meteo { .. } => KIND_METEO,
            Payload::DiyTemp { .. } => KIND_DIY_TEMP,
        }
    }

    /// Declared value count. The meteo station always reports 6, even when
    /// the frame carries the seventh rain-rate word; receivers key on the
    /// frame length.
    fn declared_values(&self) -> u8 {
        match self {
            Payload::Bme280 { .. } | Payload::Scd40 { .. } => 3,
            Payload::Veml7700 { .. } => 2,
            Payload::Meteo { .. } => 6,
            Payload::DiyTemp { .. } => 1,
        }
    }

    fn encode_words(&self, out: &mut Vec<u8>) {
        match *self {
            Payload::Bme280 {
                temp_c,
                pressure_hpa,
                humidity_pct,
            } => {
                push_word(out, (temp_c * 100.0).round() as i16 as u16);
                push_word(out, (pressure_hpa * 10.0).round() as u16);
                push_word(out, (humidity_pct * 100.0).round() as u16);
            }
            Payload::Scd40 {
                temp_c,
                co2_ppm,
                humidity_pct,
            } => {
                push_word(out, (temp_c * 100.0).round() as i16 as u16);
                push_word(out, co2_ppm);
                push_word(out, (humidity_pct * 100.0).round() as u16);
            }
            Payload::Veml7700 { lux } => {
                let raw = (lux * 100.0).round() as u32;
                out.extend_from_slice(&raw.to_be_bytes());
            }
            Payload::Meteo {
                temp_c,
                pressure_hpa,
                humidity_pct,
                wind_speed_ms,
                wind_direction_deg,
                rain_mm,
                rain_rate_mmh,
            } => {
                push_word(out, (temp_c * 100.0).round() as i16 as u16);
                push_word(out, (pressure_hpa * 10.0).round() as u16);
                push_word(out, (humidity_pct * 100.0).round() as u16);
                push_word(out, (wind_speed_ms * 10.0).round() as u16);
                push_word(out, wind_direction_deg);
                push_word(out, (rain_mm * 1000.0).round() as u16);
                if let Some(rate) = rain_rate_mmh {
                    push_word(out, (rate * 100.0).round() as u16);
                }
            }
            Payload::DiyTemp { temp_c } => {
                push_word(out, (temp_c * 100.0).round() as i16 as u16);
            }
        }
    }
}

fn push_word(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

// ---------------------------------------------------------------------------
// Frame assembly and obfuscation
// ---------------------------------------------------------------------------

pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Header + payload words + trailing XOR checksum, ready for obfuscation.
pub fn build_frame(serial: u32, battery_mv: u16, payload: &Payload) -> Vec<u8> {
    let mut frame = vec![
        MAGIC,
        payload.kind_code(),
        (serial >> 16) as u8,
        (serial >> 8) as u8,
        serial as u8,
        (battery_mv >> 8) as u8,
        battery_mv as u8,
        payload.declared_values(),
    ];
    payload.encode_words(&mut frame);
    frame.push(xor_checksum(&frame));
    frame
}

/// XOR stream keyed by the little-endian octets of the device key, chained
/// on the previous cipher byte shifted right once. Applying the receiver's
/// inverse with the same key restores the plaintext.
pub fn obfuscate(plain: &[u8], key: u32) -> Vec<u8> {
    let key_bytes = key.to_le_bytes();
    let mut prev = 0u8;
    plain
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let c = p ^ key_bytes[i & 0x03] ^ (prev >> 1);
            prev = c;
            c
        })
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
