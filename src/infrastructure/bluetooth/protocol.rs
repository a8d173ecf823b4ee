//! WeDo 2.0 / LPF2 Protocol
//!
//! GATT identifiers and the frame encoders for the hub's input and output
//! command characteristics. Everything here is pure: encoders clamp their
//! inputs instead of failing.

use crate::domain::models::{DeviceType, DeviceValue, Port};
use std::fmt::Write as _;

/// LPF2 hub service
pub const HUB_SERVICE_UUID: &str = "00001523-1212-efde-1523-785feabcd123";
/// Hub name (vendor characteristic)
pub const HUB_NAME_UUID: &str = "00001524-1212-efde-1523-785feabcd123";
/// Port attach/detach notifications
pub const PORT_INFO_UUID: &str = "00001527-1212-efde-1523-785feabcd123";
/// Sensor readings, `{header, port, value type, value...}`
pub const SENSOR_VALUES_UUID: &str = "00001560-1212-efde-1523-785feabcd123";
/// 11-byte setup frames
pub const INPUT_COMMAND_UUID: &str = "00001563-1212-efde-1523-785feabcd123";
/// Actuator frames
pub const OUTPUT_COMMAND_UUID: &str = "00001565-1212-efde-1523-785feabcd123";
/// Firmware notifications
pub const FIRMWARE_CHAR_UUID: &str = "00004f01-1212-efde-1523-785feabcd123";

pub const DEVICE_NAME_UUID: &str = "00002a00-0000-1000-8000-00805f9b34fb";
pub const MANUFACTURER_NAME_UUID: &str = "00002a29-0000-1000-8000-00805f9b34fb";
pub const FIRMWARE_REVISION_UUID: &str = "00002a26-0000-1000-8000-00805f9b34fb";
pub const SOFTWARE_REVISION_UUID: &str = "00002a28-0000-1000-8000-00805f9b34fb";
pub const SYSTEM_ID_UUID: &str = "00002a23-0000-1000-8000-00805f9b34fb";
pub const BATTERY_LEVEL_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";

/// Upper bound for a single characteristic read
pub const MAX_READ_LEN: usize = 512;

/// Speed byte magnitude for full power
const MOTOR_SCALE: f64 = 0x54 as f64;
const MOTOR_FORWARD_BASE: u8 = 0x10;
const MOTOR_REVERSE_BASE: u8 = 0xF0;

const LED_CONNECT_ID: u8 = 0x06;

/// Normalized form of a UUID string, used as the characteristic table key.
pub fn normalize_uuid(uuid: &str) -> String {
    uuid.trim().trim_matches(|c| c == '{' || c == '}').to_lowercase()
}

/// Speed byte for a motor power in percent.
///
/// Forward power maps into `0x10..=0x64`, reverse power into
/// `0x9C..=0xEF`. Both bands grow with power.
pub fn encode_motor_power(power: i32) -> u8 {
    let power = power.clamp(-100, 100);
    let magnitude = (MOTOR_SCALE * power.unsigned_abs() as f64 / 100.0).round() as u8;
    match power {
        0 => 0x00,
        p if p > 0 => MOTOR_FORWARD_BASE + magnitude,
        _ => MOTOR_REVERSE_BASE - magnitude,
    }
}

pub fn motor_power_frame(port: Port, power: i32) -> Vec<u8> {
    vec![port.id(), 0x01, 0x01, encode_motor_power(power)]
}

pub fn motor_stop_frame(port: Port) -> Vec<u8> {
    motor_power_frame(port, 0)
}

pub fn led_color_frame(red: u8, green: u8, blue: u8) -> Vec<u8> {
    vec![LED_CONNECT_ID, 0x04, 0x03, red, green, blue]
}

pub fn led_index_frame(index: u8) -> Vec<u8> {
    vec![LED_CONNECT_ID, 0x04, 0x01, index]
}

/// Input-command frame telling the hub to treat `port` as `device_type`
/// in `mode`.
pub fn setup_frame(port: Port, device_type: DeviceType, mode: u8) -> [u8; 11] {
    setup_frame_raw(port.id(), device_type.code(), mode)
}

pub fn setup_frame_raw(port: u8, type_code: u8, mode: u8) -> [u8; 11] {
    [
        0x01, 0x02, port, type_code, mode, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01,
    ]
}

/// Tone frame, frequency in Hz and duration in ms, both little-endian.
pub fn piezo_tone_frame(port: Port, frequency: u16, duration: u16) -> Vec<u8> {
    let [freq_lo, freq_hi] = frequency.to_le_bytes();
    let [dur_lo, dur_hi] = duration.to_le_bytes();
    vec![port.id(), 0x02, 0x04, freq_lo, freq_hi, dur_lo, dur_hi]
}

pub fn stop_tone_frame(port: Port) -> Vec<u8> {
    vec![port.id(), 0x03, 0x00]
}

/// Decodes a sensor-values frame for `port`.
///
/// ```text
/// [0]    : header
/// [1]    : port id echo
/// [2]    : value type (0x01 byte, 0x02 u16, 0x03 u32)
/// [3..]  : value, little-endian
/// ```
///
/// Returns `None` when the frame is too short or belongs to another port.
pub fn decode_sensor_value(frame: &[u8], port: Port) -> Option<DeviceValue> {
    if frame.len() < 4 || frame[1] != port.id() {
        return None;
    }
    let payload = &frame[3..];
    match frame[2] {
        0x01 => Some(DeviceValue::Byte(payload[0])),
        0x02 if payload.len() >= 2 => {
            Some(DeviceValue::U16(u16::from_le_bytes([payload[0], payload[1]])))
        }
        0x03 if payload.len() >= 4 => Some(DeviceValue::U32(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))),
        0x02 | 0x03 => None,
        _ => Some(DeviceValue::Raw(payload.to_vec())),
    }
}

/// Whether a sensor-values frame answers for `port`.
pub fn echoes_port(frame: &[u8], port: Port) -> bool {
    frame.len() >= 4 && frame[1] == port.id()
}

/// Parses loosely formatted hex such as `"06 04 03 ff 00 00"`,
/// `"0x06,0x04"` or `"06:04"`. An odd digit count gets a leading zero.
pub fn parse_hex(input: &str) -> Result<Vec<u8>, String> {
    let mut digits = input
        .replace("0x", "")
        .replace("0X", "")
        .replace("\\x", "");
    digits.retain(|c| !matches!(c, ' ' | ',' | ':' | '\t'));
    if !digits.is_ascii() {
        return Err(format!("invalid hex input '{}'", input));
    }

    if digits.len() % 2 != 0 {
        digits.insert(0, '0');
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            let pair = &digits[i..i + 2];
            u8::from_str_radix(pair, 16).map_err(|e| format!("invalid hex byte '{}': {}", pair, e))
        })
        .collect()
}

pub fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// UTF-8 text when printable, otherwise hex.
pub fn bytes_to_string_safe(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string(),
        Err(_) => to_hex(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motor_power_zero_is_stop() {
        assert_eq!(encode_motor_power(0), 0x00);
        assert_eq!(motor_stop_frame(Port::A), vec![0x01, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_motor_power_bands() {
        assert_eq!(encode_motor_power(100), 0x64);
        assert_eq!(encode_motor_power(50), 0x3A);
        assert_eq!(encode_motor_power(1), 0x11);
        assert_eq!(encode_motor_power(-1), 0xEF);
        assert_eq!(encode_motor_power(-100), 0x9C);
        // Clamped
        assert_eq!(encode_motor_power(250), 0x64);
        assert_eq!(encode_motor_power(-250), 0x9C);
    }

    #[test]
    fn test_motor_power_monotonic_within_band() {
        let forward: Vec<u8> = (1..=100).map(encode_motor_power).collect();
        assert!(forward.windows(2).all(|w| w[0] <= w[1]));
        assert!(forward.iter().all(|&b| (0x10..=0x64).contains(&b)));

        let reverse: Vec<u8> = (-100..=-1).map(encode_motor_power).collect();
        assert!(reverse.windows(2).all(|w| w[0] <= w[1]));
        assert!(reverse.iter().all(|&b| (0x9C..0xF0).contains(&b)));
    }

    #[test]
    fn test_piezo_tone_little_endian() {
        let frame = piezo_tone_frame(Port::B, 440, 1000);
        assert_eq!(frame, vec![0x02, 0x02, 0x04, 0xB8, 0x01, 0xE8, 0x03]);

        for (freq, dur) in [(0u16, 0u16), (0xFFFF, 0x0100), (261, 65535)] {
            let f = piezo_tone_frame(Port::A, freq, dur);
            assert_eq!(f[4] as u16 * 256 + f[3] as u16, freq);
            assert_eq!(f[6] as u16 * 256 + f[5] as u16, dur);
        }
        assert_eq!(stop_tone_frame(Port::B), vec![0x02, 0x03, 0x00]);
    }

    #[test]
    fn test_setup_frame_shape() {
        assert_eq!(
            setup_frame(Port::Light, DeviceType::RgbLight, 1),
            [0x01, 0x02, 0x06, 0x17, 0x01, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01]
        );
        assert_eq!(setup_frame(Port::A, DeviceType::MotionSensor, 0)[3], 0x23);
    }

    #[test]
    fn test_led_frames() {
        assert_eq!(led_color_frame(0xFF, 0x00, 0x10), vec![0x06, 0x04, 0x03, 0xFF, 0x00, 0x10]);
        assert_eq!(led_index_frame(0x09), vec![0x06, 0x04, 0x01, 0x09]);
    }

    #[test]
    fn test_decode_sensor_value() {
        assert_eq!(
            decode_sensor_value(&[0x05, 0x02, 0x01, 0x2A], Port::B),
            Some(DeviceValue::Byte(0x2A))
        );
        assert_eq!(
            decode_sensor_value(&[0x06, 0x01, 0x02, 0x34, 0x12], Port::A),
            Some(DeviceValue::U16(0x1234))
        );
        assert_eq!(
            decode_sensor_value(&[0x08, 0x01, 0x03, 0x78, 0x56, 0x34, 0x12], Port::A),
            Some(DeviceValue::U32(0x1234_5678))
        );
        // Wrong port
        assert_eq!(decode_sensor_value(&[0x05, 0x01, 0x01, 0x2A], Port::B), None);
        // Truncated u16
        assert_eq!(decode_sensor_value(&[0x05, 0x01, 0x02, 0x2A], Port::A), None);
        assert_eq!(decode_sensor_value(&[0x05, 0x01, 0x01], Port::A), None);
    }

    #[test]
    fn test_parse_hex_accepts_separators() {
        assert_eq!(parse_hex("06 04 03 ff 00 00").unwrap(), vec![6, 4, 3, 0xFF, 0, 0]);
        assert_eq!(parse_hex("0x01,0x02").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex("1:02").unwrap(), vec![1, 2]);
        assert_eq!(parse_hex("abc").unwrap(), vec![0x0A, 0xBC]);
        assert!(parse_hex("zz").is_err());
        assert_eq!(to_hex(&[0x06, 0xAB]), "06 AB");
    }

    #[test]
    fn test_normalize_uuid() {
        assert_eq!(
            normalize_uuid("{00001565-1212-EFDE-1523-785FEABCD123}"),
            OUTPUT_COMMAND_UUID
        );
    }
}
