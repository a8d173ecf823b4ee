use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Physical hub connector. 1 and 2 are the external sockets, 6 is the
/// built-in RGB light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Port {
    A,
    B,
    Light,
}

impl Port {
    pub const ALL: [Port; 3] = [Port::A, Port::B, Port::Light];

    pub fn id(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::Light => 6,
        }
    }
}

impl TryFrom<u8> for Port {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            6 => Ok(Self::Light),
            other => Err(other),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Peripheral kinds the WeDo 2.0 hub reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceType {
    Motor,
    Voltage,
    Current,
    Piezo,
    RgbLight,
    TiltSensor,
    MotionSensor,
}

impl DeviceType {
    pub const ALL: [DeviceType; 7] = [
        Self::Motor,
        Self::Voltage,
        Self::Current,
        Self::Piezo,
        Self::RgbLight,
        Self::TiltSensor,
        Self::MotionSensor,
    ];

    /// Type byte used on the wire.
    pub fn code(self) -> u8 {
        match self {
            Self::Motor => 0x01,
            Self::Voltage => 0x14,
            Self::Current => 0x15,
            Self::Piezo => 0x16,
            Self::RgbLight => 0x17,
            Self::TiltSensor => 0x22,
            Self::MotionSensor => 0x23,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Motor => "Motor",
            Self::Voltage => "Voltage Sensor",
            Self::Current => "Current Sensor",
            Self::Piezo => "Piezo Tone",
            Self::RgbLight => "RGB Light",
            Self::TiltSensor => "Tilt Sensor",
            Self::MotionSensor => "Motion Sensor",
        }
    }

    /// Mode sent in the setup frame when nothing else is requested.
    pub fn default_mode(self) -> u8 {
        match self {
            Self::TiltSensor => mode::TILT_TILT,
            Self::RgbLight => mode::LED_RGB,
            _ => 0x00,
        }
    }

    pub fn is_actuator(self) -> bool {
        matches!(self, Self::Motor | Self::Piezo)
    }

    pub fn is_sensor(self) -> bool {
        matches!(
            self,
            Self::TiltSensor | Self::MotionSensor | Self::Voltage | Self::Current
        )
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Device input modes carried in the setup frame.
pub mod mode {
    /// LED driven by palette index
    pub const LED_INDEX: u8 = 0;
    /// LED driven by raw RGB triple
    pub const LED_RGB: u8 = 1;

    pub const MOTION_DETECT: u8 = 0;
    pub const MOTION_COUNT: u8 = 1;

    pub const TILT_ANGLE: u8 = 0;
    pub const TILT_TILT: u8 = 1;
    pub const TILT_CRASH: u8 = 2;
}

/// Named palette entries for the built-in light in index mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Pink,
    Purple,
    Blue,
    LightBlue,
    Green,
    Yellow,
    Red,
    White,
}

impl LedColor {
    pub fn index(self) -> u8 {
        match self {
            Self::Pink => 0x01,
            Self::Purple => 0x02,
            Self::Blue => 0x03,
            Self::LightBlue => 0x04,
            Self::Green => 0x05,
            Self::Yellow => 0x07,
            Self::Red => 0x09,
            Self::White => 0x0A,
        }
    }
}

impl std::str::FromStr for LedColor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pink" => Ok(Self::Pink),
            "purple" => Ok(Self::Purple),
            "blue" => Ok(Self::Blue),
            "lightblue" | "light-blue" => Ok(Self::LightBlue),
            "green" => Ok(Self::Green),
            "yellow" => Ok(Self::Yellow),
            "red" => Ok(Self::Red),
            "white" => Ok(Self::White),
            other => Err(format!("unknown colour '{}'", other)),
        }
    }
}

/// Last reading of a device, shaped by the value-type byte of the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceValue {
    Byte(u8),
    U16(u16),
    U32(u32),
    Raw(Vec<u8>),
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::Raw(bytes) => write!(f, "{:02X?}", bytes),
        }
    }
}

/// A peripheral confirmed on a hub port.
///
/// Records are replaced as a whole through the registry and are never
/// removed; a detached peripheral stays with `connected == false`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub port: Port,
    pub device_type: DeviceType,
    pub name: String,
    pub connected: bool,
    pub last_value: Option<DeviceValue>,
    pub last_update: SystemTime,
    pub properties: BTreeMap<String, DeviceValue>,
}

impl Device {
    pub fn new(port: Port, device_type: DeviceType) -> Self {
        Self {
            port,
            device_type,
            name: device_type.name().to_string(),
            connected: true,
            last_value: None,
            last_update: SystemTime::now(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: u8) -> Self {
        self.properties
            .insert("mode".to_string(), DeviceValue::Byte(mode));
        self
    }

    pub fn mode(&self) -> Option<u8> {
        match self.properties.get("mode") {
            Some(DeviceValue::Byte(m)) => Some(*m),
            _ => None,
        }
    }

    /// Copy of this record marked as detached.
    pub fn disconnected(&self) -> Self {
        Self {
            connected: false,
            last_update: SystemTime::now(),
            ..self.clone()
        }
    }

    /// Copy of this record carrying a fresh reading.
    pub fn with_value(&self, value: DeviceValue) -> Self {
        Self {
            last_value: Some(value),
            last_update: SystemTime::now(),
            ..self.clone()
        }
    }
}

/// Metadata about the connected hub.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubInfo {
    pub name: String,
    pub address: String,
    pub rssi: i16,
    pub manufacturer: String,
    pub firmware_version: String,
    pub software_version: String,
    pub system_id: String,
    pub battery: Option<u8>,
    pub last_updated: Option<SystemTime>,
}

impl fmt::Display for HubInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "Address: {}", self.address)?;
        if !self.manufacturer.is_empty() {
            writeln!(f, "Manufacturer: {}", self.manufacturer)?;
        }
        if !self.firmware_version.is_empty() {
            writeln!(f, "Firmware: {}", self.firmware_version)?;
        }
        if !self.software_version.is_empty() {
            writeln!(f, "Software: {}", self.software_version)?;
        }
        if !self.system_id.is_empty() {
            writeln!(f, "System ID: {}", self.system_id)?;
        }
        if let Some(level) = self.battery {
            writeln!(f, "Battery: {}%", level.min(100))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Change notifications published by the hub session.
#[derive(Debug, Clone)]
pub enum HubEvent {
    Battery(u8),
    HubInfo(HubInfo),
    Device(Device),
    Connection(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_ids() {
        for port in Port::ALL {
            assert_eq!(Port::try_from(port.id()), Ok(port));
        }
        assert_eq!(Port::try_from(3), Err(3));
        assert_eq!(Port::try_from(0), Err(0));
    }

    #[test]
    fn test_device_type_codes() {
        for t in DeviceType::ALL {
            assert_eq!(DeviceType::from_code(t.code()), Some(t));
        }
        assert_eq!(DeviceType::from_code(0x00), None);
        assert_eq!(DeviceType::from_code(0x25), None);
    }

    #[test]
    fn test_disconnected_copy_keeps_identity() {
        let device = Device::new(Port::B, DeviceType::TiltSensor).with_mode(mode::TILT_TILT);
        let gone = device.disconnected();
        assert!(!gone.connected);
        assert_eq!(gone.device_type, DeviceType::TiltSensor);
        assert_eq!(gone.mode(), Some(mode::TILT_TILT));
    }

    #[test]
    fn test_hub_info_display_skips_empty() {
        let info = HubInfo {
            name: "LPF2 Smart Hub".into(),
            address: "24:71:89:00:00:01".into(),
            battery: Some(87),
            ..Default::default()
        };
        let text = info.to_string();
        assert!(text.contains("Battery: 87%"));
        assert!(!text.contains("Manufacturer"));
    }
}
