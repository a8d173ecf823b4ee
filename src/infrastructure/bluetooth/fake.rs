//! In-process fake hub
//!
//! Implements the adapter traits against a scripted WeDo 2.0 hub so the
//! protocol engine can run without a radio. Each test builds its own
//! instance; the CLI uses one for `--simulate`.
//!
//! Like the real firmware, the fake acknowledges setup and actuator frames
//! whatever is plugged in. Only sensor reads reveal the truth: after a setup
//! frame for the sensor that is actually attached, the sensor-values
//! characteristic echoes that port.

use crate::domain::models::{DeviceType, Port};
use crate::infrastructure::bluetooth::adapter::{
    AdapterError, Advertisement, BleAdapter, BleCharacteristic, BlePeripheral,
};
use crate::infrastructure::bluetooth::protocol::{self, normalize_uuid};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::trace;

type WriteRule = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

const DEVICE_INFO_SERVICE_UUID: &str = "0000180a-0000-1000-8000-00805f9b34fb";
const BATTERY_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";
const GENERIC_ACCESS_SERVICE_UUID: &str = "00001800-0000-1000-8000-00805f9b34fb";
const LPF2_EXTENDED_SERVICE_UUID: &str = "00004f0e-1212-efde-1523-785feabcd123";

/// Characteristics a WeDo 2.0 hub exposes, with their service.
const STANDARD_LAYOUT: &[(&str, &str)] = &[
    (protocol::DEVICE_NAME_UUID, GENERIC_ACCESS_SERVICE_UUID),
    (protocol::HUB_NAME_UUID, protocol::HUB_SERVICE_UUID),
    (protocol::PORT_INFO_UUID, protocol::HUB_SERVICE_UUID),
    (protocol::SENSOR_VALUES_UUID, protocol::HUB_SERVICE_UUID),
    (protocol::INPUT_COMMAND_UUID, protocol::HUB_SERVICE_UUID),
    (protocol::OUTPUT_COMMAND_UUID, protocol::HUB_SERVICE_UUID),
    (protocol::FIRMWARE_CHAR_UUID, LPF2_EXTENDED_SERVICE_UUID),
    (protocol::MANUFACTURER_NAME_UUID, DEVICE_INFO_SERVICE_UUID),
    (protocol::FIRMWARE_REVISION_UUID, DEVICE_INFO_SERVICE_UUID),
    (protocol::SOFTWARE_REVISION_UUID, DEVICE_INFO_SERVICE_UUID),
    (protocol::SYSTEM_ID_UUID, DEVICE_INFO_SERVICE_UUID),
    (protocol::BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID),
];

pub const FAKE_HUB_ADDRESS: &str = "24:71:89:00:00:01";
pub const FAKE_HUB_NAME: &str = "LPF2 Smart Hub";

struct FakeState {
    advertisements: Mutex<Vec<Advertisement>>,
    layout: Mutex<Vec<(String, String)>>,
    values: Mutex<HashMap<String, Vec<u8>>>,
    read_queue: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    read_delays: Mutex<HashMap<String, Duration>>,
    failing_reads: Mutex<HashSet<String>>,
    failing_subscriptions: Mutex<HashSet<String>>,
    write_rules: Mutex<Vec<WriteRule>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    attached: Mutex<HashMap<Port, DeviceType>>,
    scan_sender: Mutex<Option<mpsc::UnboundedSender<Advertisement>>>,
    scan_stops: AtomicUsize,
    connect_error: Mutex<Option<AdapterError>>,
    link: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable WeDo 2.0 hub. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FakeHub {
    state: Arc<FakeState>,
}

impl Default for FakeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHub {
    pub fn new() -> Self {
        let (link, _) = watch::channel(false);
        let layout = STANDARD_LAYOUT
            .iter()
            .map(|(c, s)| (c.to_string(), s.to_string()))
            .collect();

        let mut values = HashMap::new();
        values.insert(protocol::DEVICE_NAME_UUID.to_string(), FAKE_HUB_NAME.as_bytes().to_vec());
        values.insert(protocol::HUB_NAME_UUID.to_string(), FAKE_HUB_NAME.as_bytes().to_vec());
        values.insert(protocol::MANUFACTURER_NAME_UUID.to_string(), b"LEGO System A/S".to_vec());
        values.insert(protocol::FIRMWARE_REVISION_UUID.to_string(), b"1.0.00.0224".to_vec());
        values.insert(protocol::SOFTWARE_REVISION_UUID.to_string(), b"2.0.00.0016".to_vec());
        values.insert(
            protocol::SYSTEM_ID_UUID.to_string(),
            vec![0x01, 0x00, 0x89, 0x71, 0x24, 0x00, 0x00, 0x01],
        );
        values.insert(protocol::BATTERY_LEVEL_UUID.to_string(), vec![100]);

        Self {
            state: Arc::new(FakeState {
                advertisements: Mutex::new(vec![Advertisement {
                    name: FAKE_HUB_NAME.to_string(),
                    address: FAKE_HUB_ADDRESS.to_string(),
                    rssi: -52,
                }]),
                layout: Mutex::new(layout),
                values: Mutex::new(values),
                read_queue: Mutex::new(HashMap::new()),
                read_delays: Mutex::new(HashMap::new()),
                failing_reads: Mutex::new(HashSet::new()),
                failing_subscriptions: Mutex::new(HashSet::new()),
                write_rules: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                subscribers: Mutex::new(HashMap::new()),
                attached: Mutex::new(HashMap::new()),
                scan_sender: Mutex::new(None),
                scan_stops: AtomicUsize::new(0),
                connect_error: Mutex::new(None),
                link,
            }),
        }
    }

    /// Replaces the advertisements seen by a scan.
    pub fn set_advertisements(&self, advertisements: Vec<Advertisement>) {
        *lock(&self.state.advertisements) = advertisements;
    }

    /// Removes a characteristic from discovery, as on firmware without it.
    pub fn remove_characteristic(&self, uuid: &str) {
        let uuid = normalize_uuid(uuid);
        lock(&self.state.layout).retain(|(c, _)| *c != uuid);
    }

    pub fn set_value(&self, uuid: &str, value: Vec<u8>) {
        lock(&self.state.values).insert(normalize_uuid(uuid), value);
    }

    /// Next read of `uuid` returns `value`; queued values win over the
    /// stored one.
    pub fn queue_read(&self, uuid: &str, value: Vec<u8>) {
        lock(&self.state.read_queue)
            .entry(normalize_uuid(uuid))
            .or_default()
            .push_back(value);
    }

    /// Reads of `uuid` answer after `delay`, with the value as it was when
    /// the read started.
    pub fn delay_reads(&self, uuid: &str, delay: Duration) {
        lock(&self.state.read_delays).insert(uuid.to_string(), delay);
    }

    pub fn fail_reads(&self, uuid: &str) {
        lock(&self.state.failing_reads).insert(normalize_uuid(uuid));
    }

    pub fn fail_subscriptions(&self, uuid: &str) {
        lock(&self.state.failing_subscriptions).insert(normalize_uuid(uuid));
    }

    /// Writes matching `rule(uuid, data)` are rejected.
    pub fn fail_writes_when(&self, rule: impl Fn(&str, &[u8]) -> bool + Send + Sync + 'static) {
        lock(&self.state.write_rules).push(Box::new(rule));
    }

    pub fn fail_connect(&self, error: AdapterError) {
        *lock(&self.state.connect_error) = Some(error);
    }

    /// Plugs a device in and announces it on the port-info characteristic.
    pub fn attach(&self, port: Port, device_type: DeviceType) {
        lock(&self.state.attached).insert(port, device_type);
        self.notify(
            protocol::PORT_INFO_UUID,
            vec![port.id(), 0x01, 0x00, device_type.code(), 0x00, 0x00, 0x00, 0x10],
        );
    }

    /// Plugs a device in without any notification, as when the hub stays
    /// silent about it.
    pub fn attach_silently(&self, port: Port, device_type: DeviceType) {
        lock(&self.state.attached).insert(port, device_type);
    }

    pub fn detach(&self, port: Port) {
        lock(&self.state.attached).remove(&port);
        self.notify(protocol::PORT_INFO_UUID, vec![port.id(), 0x00]);
    }

    /// Delivers a notification to every subscriber of `uuid`.
    pub fn notify(&self, uuid: &str, data: Vec<u8>) {
        let uuid = normalize_uuid(uuid);
        if let Some(senders) = lock(&self.state.subscribers).get_mut(&uuid) {
            senders.retain(|tx| tx.send(data.clone()).is_ok());
        }
    }

    pub fn is_subscribed(&self, uuid: &str) -> bool {
        lock(&self.state.subscribers)
            .get(&normalize_uuid(uuid))
            .map(|senders| !senders.is_empty())
            .unwrap_or(false)
    }

    /// Simulates loss of the radio link.
    pub fn drop_link(&self) {
        self.state.link.send_replace(false);
        lock(&self.state.subscribers).clear();
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state.writes).clone()
    }

    pub fn writes_to(&self, uuid: &str) -> Vec<Vec<u8>> {
        let uuid = normalize_uuid(uuid);
        lock(&self.state.writes)
            .iter()
            .filter(|(c, _)| *c == uuid)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state.writes).clear();
    }

    pub fn scan_stops(&self) -> usize {
        self.state.scan_stops.load(Ordering::SeqCst)
    }

    fn is_linked(&self) -> bool {
        *self.state.link.borrow()
    }

    fn read_value(&self, uuid: &str) -> Result<Vec<u8>, AdapterError> {
        if !self.is_linked() {
            return Err(AdapterError::Disconnected);
        }
        if lock(&self.state.failing_reads).contains(uuid) {
            return Err(AdapterError::Communication(format!("read of {} rejected", uuid)));
        }
        if let Some(value) = lock(&self.state.read_queue)
            .get_mut(uuid)
            .and_then(VecDeque::pop_front)
        {
            return Ok(value);
        }
        Ok(lock(&self.state.values).get(uuid).cloned().unwrap_or_default())
    }

    fn write_value(&self, uuid: &str, data: &[u8]) -> Result<(), AdapterError> {
        if !self.is_linked() {
            return Err(AdapterError::Disconnected);
        }
        if lock(&self.state.write_rules).iter().any(|rule| rule(uuid, data)) {
            trace!("Fake hub rejecting write to {}: {:02X?}", uuid, data);
            return Err(AdapterError::Communication(format!("write to {} rejected", uuid)));
        }
        lock(&self.state.writes).push((uuid.to_string(), data.to_vec()));

        if uuid == protocol::INPUT_COMMAND_UUID {
            self.apply_setup(data);
        }
        Ok(())
    }

    /// Points the sensor-values characteristic at the configured port when
    /// the requested sensor is really attached there.
    fn apply_setup(&self, data: &[u8]) {
        if data.len() != 11 || data[0] != 0x01 || data[1] != 0x02 {
            return;
        }
        let (Ok(port), Some(requested)) = (Port::try_from(data[2]), DeviceType::from_code(data[3]))
        else {
            return;
        };
        let attached = lock(&self.state.attached).get(&port).copied();
        if attached == Some(requested) && requested.is_sensor() {
            lock(&self.state.values).insert(
                protocol::SENSOR_VALUES_UUID.to_string(),
                vec![0x04, port.id(), 0x01, 0x05],
            );
        }
    }

    fn subscribe_to(&self, uuid: &str) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
        if !self.is_linked() {
            return Err(AdapterError::Disconnected);
        }
        if lock(&self.state.failing_subscriptions).contains(uuid) {
            return Err(AdapterError::Unsupported(format!("notifications on {}", uuid)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state.subscribers)
            .entry(uuid.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl BleAdapter for FakeHub {
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>, AdapterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for advertisement in lock(&self.state.advertisements).iter() {
            let _ = tx.send(advertisement.clone());
        }
        // Keep the stream open until the scan is stopped, like a live radio.
        *lock(&self.state.scan_sender) = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        lock(&self.state.scan_sender).take();
        self.state.scan_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(
        &self,
        advertisement: &Advertisement,
    ) -> Result<Arc<dyn BlePeripheral>, AdapterError> {
        if let Some(error) = lock(&self.state.connect_error).clone() {
            return Err(error);
        }
        self.state.link.send_replace(true);
        Ok(Arc::new(FakePeripheral {
            hub: self.clone(),
            address: advertisement.address.clone(),
        }))
    }
}

struct FakePeripheral {
    hub: FakeHub,
    address: String,
}

#[async_trait]
impl BlePeripheral for FakePeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn BleCharacteristic>>, AdapterError> {
        if !self.hub.is_linked() {
            return Err(AdapterError::Disconnected);
        }
        Ok(lock(&self.hub.state.layout)
            .iter()
            .map(|(uuid, service)| {
                Arc::new(FakeCharacteristic {
                    hub: self.hub.clone(),
                    uuid: uuid.clone(),
                    service: service.clone(),
                }) as Arc<dyn BleCharacteristic>
            })
            .collect())
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.hub.state.link.subscribe()
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.hub.drop_link();
        Ok(())
    }
}

struct FakeCharacteristic {
    hub: FakeHub,
    uuid: String,
    service: String,
}

#[async_trait]
impl BleCharacteristic for FakeCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn service_uuid(&self) -> String {
        self.service.clone()
    }

    async fn read(&self) -> Result<Vec<u8>, AdapterError> {
        let value = self.hub.read_value(&self.uuid);
        let delay = lock(&self.hub.state.read_delays).get(&self.uuid).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        value
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        self.hub.write_value(&self.uuid, data)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
        self.hub.subscribe_to(&self.uuid)
    }
}
