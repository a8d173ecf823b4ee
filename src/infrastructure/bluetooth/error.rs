use crate::domain::models::{DeviceType, Port};
use crate::infrastructure::bluetooth::adapter::AdapterError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("not connected to a hub")]
    NotConnected,
    #[error("characteristic {0} is not offered by this hub")]
    UnknownCharacteristic(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("write to {uuid} failed: {source}")]
    WriteFailed { uuid: String, source: AdapterError },
    #[error("read from {uuid} failed: {source}")]
    ReadFailed { uuid: String, source: AdapterError },
    #[error("port {port}: expected {expected}, found {}", describe(.found))]
    UnrecognizedDevice {
        port: Port,
        expected: DeviceType,
        found: Option<DeviceType>,
    },
    #[error("port {port}: expected a sensor, found {}", describe(.found))]
    NotASensor {
        port: Port,
        found: Option<DeviceType>,
    },
    #[error("connection failed: {0}")]
    ConnectFailed(AdapterError),
    #[error("scan failed: {0}")]
    ScanFailed(AdapterError),
}

impl HubError {
    pub(crate) fn write_failed(uuid: &str, source: AdapterError) -> Self {
        match source {
            AdapterError::Disconnected => Self::NotConnected,
            source => Self::WriteFailed {
                uuid: uuid.to_string(),
                source,
            },
        }
    }

    pub(crate) fn read_failed(uuid: &str, source: AdapterError) -> Self {
        match source {
            AdapterError::Disconnected => Self::NotConnected,
            source => Self::ReadFailed {
                uuid: uuid.to_string(),
                source,
            },
        }
    }
}

fn describe(found: &Option<DeviceType>) -> String {
    match found {
        Some(device_type) => device_type.to_string(),
        None => "no device".to_string(),
    }
}
