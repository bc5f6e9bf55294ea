//! LoRa frame decoding: XOR-stream deobfuscation, checksum and serial
//! validation, per-kind payload parsing with range checks, and the
//! trial-decryption loop that doubles as device selection.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! [0]    magic/version byte
//! [1]    device kind
//! [2..5] 24-bit serial
//! [5..7] battery millivolts
//! [7]    declared payload value count
//! [8..]  2-byte payload words (4-byte lux word for VEML7700)
//! [last] XOR checksum over everything before it
//! ```

use std::fmt;

use crate::device::{Device, DeviceKind, Measurement};
use crate::registry::DeviceHandle;

/// Header bytes before the payload words.
const HEADER_LEN: usize = 8;
/// Shortest parseable frame: header plus checksum.
const MIN_FRAME_LEN: usize = HEADER_LEN + 1;
/// A LoRa payload never exceeds one FIFO.
const MAX_FRAME_LEN: usize = 255;
/// Declared value counts above this are garbage.
const MAX_NUM_VALUES: u8 = 10;

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// A registered device's key produced a checksum-valid plaintext whose
    /// serial matches that device.
    Matched {
        handle: DeviceHandle,
        measurement: Measurement,
    },
    /// No registered key fits; the frame is somebody else's traffic or
    /// noise.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    TooShort(usize),
    TooLong(usize),
    UnknownKind(u8),
    /// A known device sent an out-of-contract value; the sensor is silent
    /// or malfunctioning.
    Rejected { field: &'static str, value: f32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "frame too short: {len} bytes"),
            Self::TooLong(len) => write!(f, "frame too long: {len} bytes"),
            Self::UnknownKind(value) => write!(f, "unknown device kind 0x{value:02x}"),
            Self::Rejected { field, value } => {
                write!(f, "packet rejected: {field} = {value} out of range")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Obfuscation
// ---------------------------------------------------------------------------

/// Undo the sensor-side XOR stream. Key bytes are the little-endian octets
/// of the 32-bit key; each output byte also mixes in the previous *cipher*
/// byte shifted right once, so the transform is self-synchronising and
/// self-inverse under the same key.
pub fn decrypt(cipher: &[u8], key: u32) -> Vec<u8> {
    let key_bytes = key.to_le_bytes();
    let mut prev = 0u8;
    cipher
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let plain = c ^ key_bytes[i & 0x03] ^ (prev >> 1);
            prev = c;
            plain
        })
        .collect()
}

/// XOR of all bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &b| acc ^ b)
}

/// Last byte must equal the XOR of everything before it.
pub fn checksum_ok(plain: &[u8]) -> bool {
    if plain.len() < 2 {
        return false;
    }
    plain[plain.len() - 1] == xor_checksum(&plain[..plain.len() - 1])
}

/// 24-bit serial at offset 2.
pub fn serial_of(plain: &[u8]) -> u32 {
    ((plain[2] as u32) << 16) | ((plain[3] as u32) << 8) | plain[4] as u32
}

/// Space-separated lowercase hex, for debug frame dumps.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Trial decryption
// ---------------------------------------------------------------------------

/// Try every registered device's key against the frame. Matching requires
/// both a valid checksum *and* the embedded serial equalling the candidate's
/// serial, so duplicate keys across the fleet cannot misroute a packet. The
/// matched plaintext is parsed once, here.
pub fn try_decode(
    cipher: &[u8],
    candidates: &[(DeviceHandle, Device)],
) -> Result<DecodeOutcome, DecodeError> {
    if cipher.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort(cipher.len()));
    }
    if cipher.len() > MAX_FRAME_LEN {
        return Err(DecodeError::TooLong(cipher.len()));
    }

    for (handle, device) in candidates {
        let plain = decrypt(cipher, device.key);
        if checksum_ok(&plain) && serial_of(&plain) == device.serial {
            let measurement = parse_frame(&plain)?;
            return Ok(DecodeOutcome::Matched {
                handle: *handle,
                measurement,
            });
        }
    }

    Ok(DecodeOutcome::Unknown)
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

fn word(plain: &[u8], offset: usize) -> u16 {
    ((plain[offset] as u16) << 8) | plain[offset + 1] as u16
}

fn signed_word(plain: &[u8], offset: usize) -> i16 {
    word(plain, offset) as i16
}

/// Parse a checksum-valid plaintext frame into a measurement, enforcing the
/// per-kind length contract and value ranges.
pub fn parse_frame(plain: &[u8]) -> Result<Measurement, DecodeError> {
    let len = plain.len();
    let kind_byte = plain[1];
    let kind = DeviceKind::from_wire(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;

    let num_values = plain[7];
    if num_values > MAX_NUM_VALUES {
        return Err(DecodeError::Rejected {
            field: "num_values",
            value: num_values as f32,
        });
    }

    // Length contract. METEO is special-cased by length alone: the 23-byte
    // form carries a rain-rate word while still declaring 6 values.
    match kind {
        DeviceKind::Meteo => {
            if len != 21 && len != 23 {
                return Err(DecodeError::Rejected {
                    field: "length",
                    value: len as f32,
                });
            }
        }
        _ => {
            if len != HEADER_LEN + 2 * num_values as usize + 1 {
                return Err(DecodeError::Rejected {
                    field: "length",
                    value: len as f32,
                });
            }
            let needed = match kind {
                DeviceKind::Bme280 | DeviceKind::Scd40 => 6,
                DeviceKind::Veml7700 => 4,
                DeviceKind::DiyTemp => 2,
                DeviceKind::Meteo => unreachable!(),
            };
            if len < HEADER_LEN + needed + 1 {
                return Err(DecodeError::Rejected {
                    field: "length",
                    value: len as f32,
                });
            }
        }
    }

    let battery_volts = word(plain, 5) as f32 / 1000.0;
    let mut m = Measurement {
        battery_volts,
        ..Measurement::default()
    };

    match kind {
        DeviceKind::Bme280 => {
            m.temperature = Some(check_temperature(signed_word(plain, 8))?);
            m.pressure = Some(check_pressure(word(plain, 10))?);
            m.humidity = Some(check_humidity(word(plain, 12))?);
        }
        DeviceKind::Scd40 => {
            m.temperature = Some(check_temperature(signed_word(plain, 8))?);
            m.co2 = Some(check_co2(word(plain, 10))?);
            m.humidity = Some(check_humidity(word(plain, 12))?);
        }
        DeviceKind::Veml7700 => {
            let raw = ((plain[8] as u32) << 24)
                | ((plain[9] as u32) << 16)
                | ((plain[10] as u32) << 8)
                | plain[11] as u32;
            m.lux = Some(raw as f32 / 100.0);
        }
        DeviceKind::DiyTemp => {
            m.temperature = Some(check_temperature(signed_word(plain, 8))?);
        }
        DeviceKind::Meteo => {
            m.temperature = Some(check_temperature(signed_word(plain, 8))?);
            m.pressure = Some(check_pressure(word(plain, 10))?);
            m.humidity = Some(check_humidity(word(plain, 12))?);
            m.wind_speed = Some(check_wind_speed(word(plain, 14))?);
            m.wind_direction = Some(check_wind_direction(word(plain, 16))?);
            m.rain_amount = Some(word(plain, 18) as f32 / 1000.0);
            if len == 23 {
                m.rain_rate = Some(word(plain, 20) as f32 / 100.0);
            }
        }
    }

    Ok(m)
}

// -- Range checks (raw wire units in, physical units out) -------------------

fn check_temperature(raw: i16) -> Result<f32, DecodeError> {
    let celsius = raw as f32 / 100.0;
    if !(-50.0..=60.0).contains(&celsius) {
        return Err(DecodeError::Rejected {
            field: "temperature",
            value: celsius,
        });
    }
    Ok(celsius)
}

fn check_pressure(raw: u16) -> Result<f32, DecodeError> {
    let hpa = raw as f32 / 10.0;
    if !(850.0..=1100.0).contains(&hpa) {
        return Err(DecodeError::Rejected {
            field: "pressure",
            value: hpa,
        });
    }
    Ok(hpa)
}

fn check_humidity(raw: u16) -> Result<f32, DecodeError> {
    let percent = raw as f32 / 100.0;
    if percent > 100.0 {
        return Err(DecodeError::Rejected {
            field: "humidity",
            value: percent,
        });
    }
    Ok(percent)
}

fn check_co2(raw: u16) -> Result<f32, DecodeError> {
    let ppm = raw as f32;
    if ppm > 10000.0 {
        return Err(DecodeError::Rejected {
            field: "co2",
            value: ppm,
        });
    }
    Ok(ppm)
}

fn check_wind_speed(raw: u16) -> Result<f32, DecodeError> {
    let ms = raw as f32 / 10.0;
    if ms > 60.0 {
        return Err(DecodeError::Rejected {
            field: "wind_speed",
            value: ms,
        });
    }
    Ok(ms)
}

fn check_wind_direction(raw: u16) -> Result<u16, DecodeError> {
    if raw > 359 {
        return Err(DecodeError::Rejected {
            field: "wind_direction",
            value: raw as f32,
        });
    }
    Ok(raw)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u8 = 0x42;

    /// Sensor-side transform: the inverse of `decrypt`, chained on the
    /// produced cipher byte.
    fn encrypt(plain: &[u8], key: u32) -> Vec<u8> {
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

    /// Assemble header + payload and append the XOR checksum.
    fn build_frame(kind: u8, serial: u32, battery_mv: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![
            MAGIC,
            kind,
            (serial >> 16) as u8,
            (serial >> 8) as u8,
            serial as u8,
            (battery_mv >> 8) as u8,
            battery_mv as u8,
            (payload.len() / 2) as u8,
        ];
        f.extend_from_slice(payload);
        f.push(xor_checksum(&f));
        f
    }

    fn candidate(kind: DeviceKind, serial: u32, key: u32) -> (DeviceHandle, Device) {
        (
            DeviceHandle::from_index(0),
            Device::new(kind, serial, key, "test".into()),
        )
    }

    fn word_bytes(v: u16) -> [u8; 2] {
        [(v >> 8) as u8, v as u8]
    }

    fn bme280_payload(temp_c100: i16, press_hpa10: u16, hum_pct100: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&word_bytes(temp_c100 as u16));
        p.extend_from_slice(&word_bytes(press_hpa10));
        p.extend_from_slice(&word_bytes(hum_pct100));
        p
    }

    // -- Obfuscation --------------------------------------------------------

    #[test]
    fn decrypt_inverts_encrypt_for_arbitrary_bytes() {
        let plain: Vec<u8> = (0..255u32).map(|i| (i * 31 + 7) as u8).collect();
        for key in [0u32, 1, 0xDEADBEEF, 0xFFFFFFFF, 0x00C0FFEE] {
            assert_eq!(decrypt(&encrypt(&plain, key), key), plain, "key {key:#x}");
        }
    }

    #[test]
    fn decrypt_of_empty_is_empty() {
        assert!(decrypt(&[], 0xDEADBEEF).is_empty());
    }

    #[test]
    fn key_bytes_are_little_endian() {
        // First byte only mixes with the lowest key octet (prev starts at 0).
        let cipher = encrypt(&[0x00], 0x000000AB);
        assert_eq!(cipher, vec![0xAB]);
    }

    // -- Checksum -----------------------------------------------------------

    #[test]
    fn xor_checksum_of_empty_is_zero() {
        assert_eq!(xor_checksum(&[]), 0);
    }

    #[test]
    fn checksum_ok_accepts_built_frames() {
        let frame = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        assert!(checksum_ok(&frame));
    }

    #[test]
    fn checksum_ok_rejects_a_flipped_bit() {
        let mut frame = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        frame[9] ^= 0x01;
        assert!(!checksum_ok(&frame));
    }

    #[test]
    fn checksum_ok_rejects_tiny_buffers() {
        assert!(!checksum_ok(&[]));
        assert!(!checksum_ok(&[0x00]));
    }

    // -- Happy paths per kind ----------------------------------------------

    #[test]
    fn bme280_frame_decodes() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        let cipher = encrypt(&plain, 0xDEADBEEF);
        let devices = [candidate(DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF)];

        match try_decode(&cipher, &devices).unwrap() {
            DecodeOutcome::Matched {
                handle,
                measurement,
            } => {
                assert_eq!(handle, devices[0].0);
                assert_eq!(measurement.temperature, Some(21.0));
                assert_eq!(measurement.pressure, Some(1000.0));
                assert_eq!(measurement.humidity, Some(4320.0 / 100.0));
                assert_eq!(measurement.battery_volts, 3.0);
                assert!(measurement.co2.is_none());
                assert!(measurement.rain_amount.is_none());
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[test]
    fn scd40_frame_decodes_co2() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&word_bytes(1950u16)); // 19.50 C
        payload.extend_from_slice(&word_bytes(850)); // 850 ppm
        payload.extend_from_slice(&word_bytes(5555)); // 55.55 %
        let plain = build_frame(0x02, 0x000123, 2870, &payload);
        let cipher = encrypt(&plain, 0x01020304);
        let devices = [candidate(DeviceKind::Scd40, 0x000123, 0x01020304)];

        let DecodeOutcome::Matched { measurement, .. } = try_decode(&cipher, &devices).unwrap()
        else {
            panic!("expected Matched");
        };
        assert_eq!(measurement.co2, Some(850.0));
        assert_eq!(measurement.temperature, Some(19.5));
        assert!(measurement.pressure.is_none());
    }

    #[test]
    fn veml7700_frame_decodes_32bit_lux() {
        // 123456 hundredths = 1234.56 lx, needs all four bytes.
        let raw: u32 = 123_456;
        let payload = raw.to_be_bytes();
        let plain = build_frame(0x04, 0x0F0F0F, 3300, &payload);
        let cipher = encrypt(&plain, 0xCAFEBABE);
        let devices = [candidate(DeviceKind::Veml7700, 0x0F0F0F, 0xCAFEBABE)];

        let DecodeOutcome::Matched { measurement, .. } = try_decode(&cipher, &devices).unwrap()
        else {
            panic!("expected Matched");
        };
        assert_eq!(measurement.lux, Some(1234.56));
        assert!(measurement.temperature.is_none());
    }

    #[test]
    fn diy_temp_frame_decodes() {
        let payload = word_bytes((-1234i16) as u16); // -12.34 C
        let plain = build_frame(0x51, 0x424242, 3100, &payload);
        let cipher = encrypt(&plain, 0x0BADF00D);
        let devices = [candidate(DeviceKind::DiyTemp, 0x424242, 0x0BADF00D)];

        let DecodeOutcome::Matched { measurement, .. } = try_decode(&cipher, &devices).unwrap()
        else {
            panic!("expected Matched");
        };
        assert_eq!(measurement.temperature, Some(-12.34));
    }

    fn meteo_payload(extended: bool) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&word_bytes(1550)); // 15.50 C
        p.extend_from_slice(&word_bytes(10150)); // 1015.0 hPa
        p.extend_from_slice(&word_bytes(7200)); // 72.00 %
        p.extend_from_slice(&word_bytes(83)); // 8.3 m/s
        p.extend_from_slice(&word_bytes(270)); // 270 deg
        p.extend_from_slice(&word_bytes(400)); // 0.400 mm
        if extended {
            p.extend_from_slice(&word_bytes(250)); // 2.50 mm/h
        }
        p
    }

    #[test]
    fn meteo_21_byte_frame_has_no_rain_rate() {
        let plain = build_frame(0x03, 0x777777, 3900, &meteo_payload(false));
        assert_eq!(plain.len(), 21);
        // The station declares 6 values either way.
        assert_eq!(plain[7], 6);
        let cipher = encrypt(&plain, 0x11223344);
        let devices = [candidate(DeviceKind::Meteo, 0x777777, 0x11223344)];

        let DecodeOutcome::Matched { measurement, .. } = try_decode(&cipher, &devices).unwrap()
        else {
            panic!("expected Matched");
        };
        assert_eq!(measurement.wind_speed, Some(8.3));
        assert_eq!(measurement.wind_direction, Some(270));
        assert_eq!(measurement.rain_amount, Some(0.4));
        assert!(measurement.rain_rate.is_none());
    }

    #[test]
    fn meteo_23_byte_frame_decodes_rain_rate_despite_declared_count() {
        // The extended frame still says num_values = 6; length wins.
        let mut plain = build_frame(0x03, 0x777777, 3900, &meteo_payload(true));
        plain[7] = 6;
        let checksum = xor_checksum(&plain[..plain.len() - 1]);
        let last = plain.len() - 1;
        plain[last] = checksum;
        assert_eq!(plain.len(), 23);

        let cipher = encrypt(&plain, 0x11223344);
        let devices = [candidate(DeviceKind::Meteo, 0x777777, 0x11223344)];

        let DecodeOutcome::Matched { measurement, .. } = try_decode(&cipher, &devices).unwrap()
        else {
            panic!("expected Matched");
        };
        assert_eq!(measurement.rain_rate, Some(2.5));
        assert_eq!(measurement.rain_amount, Some(0.4));
    }

    // -- Trial decryption ---------------------------------------------------

    #[test]
    fn wrong_key_yields_unknown() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        let cipher = encrypt(&plain, 0xDEADBEEF);
        let devices = [candidate(DeviceKind::Bme280, 0xABCDEF, 0x12345678)];
        assert_eq!(try_decode(&cipher, &devices).unwrap(), DecodeOutcome::Unknown);
    }

    #[test]
    fn matching_key_but_foreign_serial_yields_unknown() {
        // Decrypts cleanly, but the embedded serial belongs to nobody we know.
        let plain = build_frame(0x01, 0x111111, 3000, &bme280_payload(2100, 10000, 4320));
        let cipher = encrypt(&plain, 0xDEADBEEF);
        let devices = [candidate(DeviceKind::Bme280, 0x222222, 0xDEADBEEF)];
        assert_eq!(try_decode(&cipher, &devices).unwrap(), DecodeOutcome::Unknown);
    }

    #[test]
    fn empty_registry_yields_unknown() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        let cipher = encrypt(&plain, 0xDEADBEEF);
        assert_eq!(try_decode(&cipher, &[]).unwrap(), DecodeOutcome::Unknown);
    }

    #[test]
    fn twentieth_candidate_still_matches() {
        let mut devices: Vec<(DeviceHandle, Device)> = (0..19)
            .map(|i| {
                (
                    DeviceHandle::from_index(i),
                    Device::new(DeviceKind::Bme280, i as u32 + 1, 0x1000 + i as u32, "d".into()),
                )
            })
            .collect();
        devices.push((
            DeviceHandle::from_index(19),
            Device::new(DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF, "last".into()),
        ));

        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        let cipher = encrypt(&plain, 0xDEADBEEF);

        let DecodeOutcome::Matched { handle, .. } = try_decode(&cipher, &devices).unwrap() else {
            panic!("expected Matched");
        };
        assert_eq!(handle, DeviceHandle::from_index(19));
    }

    // -- Rejections ---------------------------------------------------------

    fn decode_err(plain: &[u8], kind: DeviceKind, serial: u32, key: u32) -> DecodeError {
        let cipher = encrypt(plain, key);
        let devices = [candidate(kind, serial, key)];
        try_decode(&cipher, &devices).unwrap_err()
    }

    #[test]
    fn too_short_frames_are_refused_before_any_key_is_tried() {
        assert_eq!(try_decode(&[0u8; 8], &[]).unwrap_err(), DecodeError::TooShort(8));
    }

    #[test]
    fn too_long_frames_are_refused() {
        assert_eq!(
            try_decode(&[0u8; 300], &[]).unwrap_err(),
            DecodeError::TooLong(300)
        );
    }

    #[test]
    fn unknown_wire_kind_is_rejected_after_key_match() {
        let plain = build_frame(0x07, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        assert_eq!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::UnknownKind(0x07)
        );
    }

    #[test]
    fn temperature_above_60_is_rejected() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(6001, 10000, 4320));
        assert!(matches!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "temperature",
                ..
            }
        ));
    }

    #[test]
    fn temperature_below_minus_50_is_rejected() {
        let plain = build_frame(0x51, 0xABCDEF, 3000, &word_bytes((-5001i16) as u16));
        assert!(matches!(
            decode_err(&plain, DeviceKind::DiyTemp, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "temperature",
                ..
            }
        ));
    }

    #[test]
    fn pressure_out_of_band_is_rejected() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 8499, 4320));
        assert!(matches!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "pressure",
                ..
            }
        ));
    }

    #[test]
    fn humidity_above_100_is_rejected() {
        let plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 10001));
        assert!(matches!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "humidity",
                ..
            }
        ));
    }

    #[test]
    fn co2_above_10000_is_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&word_bytes(2000));
        payload.extend_from_slice(&word_bytes(10001));
        payload.extend_from_slice(&word_bytes(5000));
        let plain = build_frame(0x02, 0xABCDEF, 3000, &payload);
        assert!(matches!(
            decode_err(&plain, DeviceKind::Scd40, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected { field: "co2", .. }
        ));
    }

    #[test]
    fn wind_speed_above_60_is_rejected() {
        let mut payload = meteo_payload(false);
        payload[6..8].copy_from_slice(&word_bytes(601));
        let plain = build_frame(0x03, 0xABCDEF, 3000, &payload);
        assert!(matches!(
            decode_err(&plain, DeviceKind::Meteo, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "wind_speed",
                ..
            }
        ));
    }

    #[test]
    fn wind_direction_above_359_is_rejected() {
        let mut payload = meteo_payload(false);
        payload[8..10].copy_from_slice(&word_bytes(360));
        let plain = build_frame(0x03, 0xABCDEF, 3000, &payload);
        assert!(matches!(
            decode_err(&plain, DeviceKind::Meteo, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "wind_direction",
                ..
            }
        ));
    }

    #[test]
    fn absurd_num_values_is_rejected() {
        let mut plain = build_frame(0x01, 0xABCDEF, 3000, &[0u8; 22]);
        plain[7] = 11;
        let checksum = xor_checksum(&plain[..plain.len() - 1]);
        let last = plain.len() - 1;
        plain[last] = checksum;
        assert!(matches!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected {
                field: "num_values",
                ..
            }
        ));
    }

    #[test]
    fn length_num_values_mismatch_is_rejected_for_non_meteo() {
        // Declares 4 values but carries 3.
        let mut plain = build_frame(0x01, 0xABCDEF, 3000, &bme280_payload(2100, 10000, 4320));
        plain[7] = 4;
        let checksum = xor_checksum(&plain[..plain.len() - 1]);
        let last = plain.len() - 1;
        plain[last] = checksum;
        assert!(matches!(
            decode_err(&plain, DeviceKind::Bme280, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected { field: "length", .. }
        ));
    }

    #[test]
    fn meteo_with_wrong_length_is_rejected() {
        // 5 payload words -> 19 bytes, neither 21 nor 23.
        let mut payload = meteo_payload(false);
        payload.truncate(10);
        let mut plain = build_frame(0x03, 0xABCDEF, 3000, &payload);
        plain[7] = 6;
        let checksum = xor_checksum(&plain[..plain.len() - 1]);
        let last = plain.len() - 1;
        plain[last] = checksum;
        assert!(matches!(
            decode_err(&plain, DeviceKind::Meteo, 0xABCDEF, 0xDEADBEEF),
            DecodeError::Rejected { field: "length", .. }
        ));
    }

    // -- Misc ---------------------------------------------------------------

    #[test]
    fn hex_dump_formats_spaced_lowercase_pairs() {
        assert_eq!(hex_dump(&[0x00, 0xAB, 0x07]), "00 ab 07");
    }
}
