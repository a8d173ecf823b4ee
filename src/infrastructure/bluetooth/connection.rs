//! BLE Connection Module
//!
//! Establishes the link to a hub, builds the characteristic table and
//! performs the best-effort reads and subscriptions that follow.

use crate::domain::models::HubInfo;
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, Advertisement, BleAdapter, BleCharacteristic, BlePeripheral,
};
use crate::infrastructure::bluetooth::error::HubError;
use crate::infrastructure::bluetooth::protocol::{self, normalize_uuid};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Characteristics by normalized UUID.
pub type CharacteristicTable = HashMap<String, Arc<dyn BleCharacteristic>>;

/// Characteristics the session subscribes to, in order.
pub const NOTIFY_UUIDS: [&str; 4] = [
    protocol::BATTERY_LEVEL_UUID,
    protocol::FIRMWARE_CHAR_UUID,
    protocol::PORT_INFO_UUID,
    protocol::SENSOR_VALUES_UUID,
];

/// Result of a successful connection
pub struct ConnectionResult {
    pub peripheral: Arc<dyn BlePeripheral>,
    pub characteristics: CharacteristicTable,
}

/// Outcome of one notification subscription.
pub struct Subscription {
    pub uuid: &'static str,
    pub result: Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError>,
}

/// BLE Connection handler
pub struct HubConnection {
    adapter: Arc<dyn BleAdapter>,
}

impl HubConnection {
    pub fn new(adapter: Arc<dyn BleAdapter>) -> Self {
        Self { adapter }
    }

    /// Connects to the advertised hub and discovers every characteristic.
    pub async fn connect(&self, advertisement: &Advertisement) -> Result<ConnectionResult, HubError> {
        info!(
            "Connecting to {} [{}]...",
            advertisement.name, advertisement.address
        );

        let peripheral = self
            .adapter
            .connect(advertisement)
            .await
            .map_err(HubError::ConnectFailed)?;

        let discovered = match peripheral.discover_characteristics().await {
            Ok(discovered) => discovered,
            Err(e) => {
                if let Err(close) = peripheral.disconnect().await {
                    debug!("Closing after failed discovery: {}", close);
                }
                return Err(HubError::ConnectFailed(e));
            }
        };

        let mut characteristics = CharacteristicTable::new();
        for characteristic in discovered {
            let uuid = normalize_uuid(&characteristic.uuid());
            debug!(
                "Discovered characteristic {} (service {})",
                uuid,
                characteristic.service_uuid()
            );
            characteristics.insert(uuid, characteristic);
        }
        info!("Found {} characteristics", characteristics.len());

        Ok(ConnectionResult {
            peripheral,
            characteristics,
        })
    }
}

/// Reads the hub's metadata. Each read is independent; a missing or failing
/// characteristic leaves its field empty.
pub async fn read_hub_info(table: &CharacteristicTable, advertisement: &Advertisement) -> HubInfo {
    let (name, manufacturer, firmware, software, system_id, battery) = tokio::join!(
        read_raw(table, protocol::DEVICE_NAME_UUID),
        read_raw(table, protocol::MANUFACTURER_NAME_UUID),
        read_raw(table, protocol::FIRMWARE_REVISION_UUID),
        read_raw(table, protocol::SOFTWARE_REVISION_UUID),
        read_raw(table, protocol::SYSTEM_ID_UUID),
        read_raw(table, protocol::BATTERY_LEVEL_UUID),
    );

    let text = |value: Option<Vec<u8>>| {
        value
            .map(|v| protocol::bytes_to_string_safe(&v))
            .unwrap_or_default()
    };

    let name = match text(name) {
        n if n.is_empty() => advertisement.name.clone(),
        n => n,
    };

    HubInfo {
        name,
        address: advertisement.address.clone(),
        rssi: advertisement.rssi,
        manufacturer: text(manufacturer),
        firmware_version: text(firmware),
        software_version: text(software),
        system_id: system_id.map(|v| protocol::to_hex(&v)).unwrap_or_default(),
        battery: battery.and_then(|v| v.first().copied()),
        last_updated: Some(SystemTime::now()),
    }
}

async fn read_raw(table: &CharacteristicTable, uuid: &str) -> Option<Vec<u8>> {
    let characteristic = table.get(uuid)?;
    match characteristic.read().await {
        Ok(mut value) if !value.is_empty() => {
            value.truncate(protocol::MAX_READ_LEN);
            Some(value)
        }
        Ok(_) => None,
        Err(e) => {
            warn!("Could not read {}: {}", uuid, e);
            None
        }
    }
}

/// Enables notifications on every characteristic in [`NOTIFY_UUIDS`] the
/// hub offers. Failures are returned, not raised.
pub async fn enable_notifications(table: &CharacteristicTable) -> Vec<Subscription> {
    let (battery, firmware, port_info, sensor) = tokio::join!(
        subscribe(table, NOTIFY_UUIDS[0]),
        subscribe(table, NOTIFY_UUIDS[1]),
        subscribe(table, NOTIFY_UUIDS[2]),
        subscribe(table, NOTIFY_UUIDS[3]),
    );
    [battery, firmware, port_info, sensor]
        .into_iter()
        .flatten()
        .collect()
}

async fn subscribe(table: &CharacteristicTable, uuid: &'static str) -> Option<Subscription> {
    let Some(characteristic) = table.get(uuid) else {
        debug!("Characteristic {} not offered; no subscription", uuid);
        return None;
    };
    let result = characteristic.subscribe().await;
    match &result {
        Ok(_) => info!("Notifications enabled on {}", uuid),
        Err(e) => warn!("Could not enable notifications on {}: {}", uuid, e),
    }
    Some(Subscription { uuid, result })
}
