//! BLE adapter seam
//!
//! The hub session talks to the radio only through these traits. The
//! platform backend (WinRT on Windows) and the in-process fake hub both
//! implement them.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("device is not connected")]
    Disconnected,
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("GATT communication failed: {0}")]
    Communication(String),
    #[error("platform error: {0}")]
    Platform(String),
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: String,
    /// `AA:BB:CC:DD:EE:FF`, upper case
    pub address: String,
    pub rssi: i16,
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Starts scanning. Advertisements arrive on the returned channel until
    /// [`BleAdapter::stop_scan`] is called.
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>, AdapterError>;

    async fn stop_scan(&self) -> Result<(), AdapterError>;

    async fn connect(
        &self,
        advertisement: &Advertisement,
    ) -> Result<Arc<dyn BlePeripheral>, AdapterError>;
}

#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn address(&self) -> String;

    /// Walks every service and returns all characteristics found.
    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn BleCharacteristic>>, AdapterError>;

    /// Link state; flips to `false` on loss of the connection.
    fn link_state(&self) -> watch::Receiver<bool>;

    async fn disconnect(&self) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait BleCharacteristic: Send + Sync {
    fn uuid(&self) -> String;

    fn service_uuid(&self) -> String;

    async fn read(&self) -> Result<Vec<u8>, AdapterError>;

    /// Write without response.
    async fn write(&self, data: &[u8]) -> Result<(), AdapterError>;

    /// Enables notifications; values arrive on the returned channel.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError>;
}

/// `0x247189000001` -> `24:71:89:00:00:01`
pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Inverse of [`format_address`]; also accepts `-` separators and lower case.
pub fn parse_address(address: &str) -> Option<u64> {
    let parts: Vec<&str> = address.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return None;
    }
    parts.iter().try_fold(0u64, |acc, part| {
        if part.len() != 2 {
            return None;
        }
        u8::from_str_radix(part, 16).ok().map(|b| (acc << 8) | b as u64)
    })
}
