//! Hub Session Module
//!
//! Main service that coordinates scanning, connection and notification
//! handling for one WeDo 2.0 hub.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──discovery──▶ Connected
//!       ▲                        │                        │
//!       └──── timeout/failure ───┘       disconnect/link loss
//!       └─────────────────────────────────────────────────┘
//! ```
//!
//! Every teardown bumps a generation counter. Scans, detector passes and
//! delayed configuration tasks watch it and stop between steps.

use crate::domain::events::EventBus;
use crate::domain::models::{
    ConnectionStatus, Device, DeviceType, HubEvent, HubInfo, Port,
};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::{DetectorSettings, ScanSettings, Settings};
use crate::infrastructure::bluetooth::adapter::{Advertisement, BleAdapter, BleCharacteristic, BlePeripheral};
use crate::infrastructure::bluetooth::connection::{
    self, CharacteristicTable, HubConnection, Subscription,
};
use crate::infrastructure::bluetooth::detector::DeviceDetector;
use crate::infrastructure::bluetooth::error::HubError;
use crate::infrastructure::bluetooth::parser::{parse_port_message, PortEventKind};
use crate::infrastructure::bluetooth::protocol::{self, normalize_uuid, to_hex};
use crate::infrastructure::bluetooth::scanner::HubScanner;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct LinkState {
    status: ConnectionStatus,
    peripheral: Option<Arc<dyn BlePeripheral>>,
    characteristics: CharacteristicTable,
    /// Notification drains and the link watcher
    tasks: Vec<JoinHandle<()>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            peripheral: None,
            characteristics: CharacteristicTable::new(),
            tasks: Vec::new(),
        }
    }
}

struct SessionInner {
    adapter: Arc<dyn BleAdapter>,
    scan_settings: ScanSettings,
    detector_settings: DetectorSettings,
    link: RwLock<LinkState>,
    hub_info: Mutex<Option<HubInfo>>,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus>,
    generation: watch::Sender<u64>,
}

/// Connection to one hub. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct HubSession {
    inner: Arc<SessionInner>,
}

impl HubSession {
    pub fn new(adapter: Arc<dyn BleAdapter>, settings: &Settings) -> Self {
        let events = EventBus::new();
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                adapter,
                scan_settings: settings.scan.clone(),
                detector_settings: settings.detector.clone(),
                link: RwLock::new(LinkState::new()),
                hub_info: Mutex::new(None),
                registry: Arc::new(DeviceRegistry::new(events.clone())),
                events,
                generation,
            }),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.inner.events.clone()
    }

    /// Shorthand for `events().subscribe()`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HubEvent> {
        self.inner.events.subscribe()
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.inner.registry.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.read_link().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Metadata of the connected hub; `None` while disconnected.
    pub fn hub_info(&self) -> Option<HubInfo> {
        self.inner.lock_hub_info().clone()
    }

    /// UUIDs discovered on the connected hub, sorted.
    pub fn characteristic_uuids(&self) -> Vec<String> {
        let mut uuids: Vec<String> = self.inner.read_link().characteristics.keys().cloned().collect();
        uuids.sort();
        uuids
    }

    pub(crate) fn detector_settings(&self) -> &DetectorSettings {
        &self.inner.detector_settings
    }

    /// Watch on the teardown generation; changes once per disconnect.
    pub(crate) fn cancellation(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    /// Scans for hubs for up to `timeout`.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<Advertisement>, HubError> {
        HubScanner::new(
            self.inner.adapter.clone(),
            self.inner.scan_settings.clone(),
            self.cancellation(),
        )
        .scan(timeout)
        .await
    }

    /// Connects to the hub at `address`, replacing any current connection.
    pub async fn connect(&self, address: &str) -> Result<(), HubError> {
        if self.status() != ConnectionStatus::Disconnected {
            info!("Already connected; disconnecting first");
            self.disconnect().await;
        }

        {
            let mut link = self.inner.write_link();
            link.status = ConnectionStatus::Connecting;
        }
        let generation = *self.inner.generation.borrow();

        let timeout = self.inner.scan_settings.connect_timeout();
        let found = HubScanner::new(
            self.inner.adapter.clone(),
            self.inner.scan_settings.clone(),
            self.cancellation(),
        )
        .find(address, timeout)
        .await;

        let advertisement = match found {
            Ok(advertisement) => advertisement,
            Err(e) => {
                warn!("Hub {} not found: {}", address, e);
                self.inner.abandon_connect(generation);
                return Err(e);
            }
        };

        let result = match HubConnection::new(self.inner.adapter.clone())
            .connect(&advertisement)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                self.inner.abandon_connect(generation);
                return Err(e);
            }
        };

        let table = result.characteristics.clone();
        let installed = {
            let mut link = self.inner.write_link();
            if *self.inner.generation.borrow() == generation {
                link.status = ConnectionStatus::Connected;
                link.peripheral = Some(result.peripheral.clone());
                link.characteristics = result.characteristics;
                link.tasks.push(spawn_link_watcher(
                    Arc::downgrade(&self.inner),
                    result.peripheral.link_state(),
                    generation,
                ));
                true
            } else {
                false
            }
        };
        if !installed {
            debug!("Disconnect requested while connecting");
            close_peripheral(&result.peripheral).await;
            return Err(HubError::NotConnected);
        }
        *self.inner.lock_hub_info() = Some(HubInfo {
            name: advertisement.name.clone(),
            address: advertisement.address.clone(),
            rssi: advertisement.rssi,
            ..HubInfo::default()
        });

        info!("Connected to {} [{}]", advertisement.name, advertisement.address);
        self.inner.events.publish(HubEvent::Connection(true));

        let (info, subscriptions) = tokio::join!(
            connection::read_hub_info(&table, &advertisement),
            connection::enable_notifications(&table),
        );
        let port_info_ok = self.attach_subscriptions(subscriptions, generation);
        self.inner.merge_hub_info(info);

        if self.inner.detector_settings.enabled {
            let delay = if port_info_ok {
                Duration::from_millis(self.inner.detector_settings.passive_wait_ms)
            } else {
                info!("No port notifications; probing ports now");
                Duration::ZERO
            };
            self.spawn_detector(delay, Port::ALL.to_vec());
        }

        Ok(())
    }

    /// Spawns the drain tasks. Returns whether port-info notifications are
    /// flowing.
    fn attach_subscriptions(&self, subscriptions: Vec<Subscription>, generation: u64) -> bool {
        let mut port_info_ok = false;
        let mut link = self.inner.write_link();
        if *self.inner.generation.borrow() != generation {
            return false;
        }
        for subscription in subscriptions {
            let Ok(rx) = subscription.result else {
                continue;
            };
            if subscription.uuid == protocol::PORT_INFO_UUID {
                port_info_ok = true;
            }
            link.tasks.push(spawn_notification_drain(
                Arc::downgrade(&self.inner),
                subscription.uuid,
                rx,
            ));
        }
        port_info_ok
    }

    /// Drops the connection and cancels any scan or detector pass. Safe to
    /// call at any time.
    pub async fn disconnect(&self) {
        if let Some(peripheral) = self.inner.teardown("disconnect requested") {
            close_peripheral(&peripheral).await;
        }
    }

    pub async fn write_characteristic(&self, uuid: &str, data: &[u8]) -> Result<(), HubError> {
        let uuid = normalize_uuid(uuid);
        let characteristic = self.inner.characteristic(&uuid)?;
        trace!("Write {} <- [{}]", uuid, to_hex(data));
        characteristic
            .write(data)
            .await
            .map_err(|e| HubError::write_failed(&uuid, e))
    }

    /// Reads up to [`protocol::MAX_READ_LEN`] bytes.
    pub async fn read_characteristic(&self, uuid: &str) -> Result<Vec<u8>, HubError> {
        let uuid = normalize_uuid(uuid);
        let characteristic = self.inner.characteristic(&uuid)?;
        let mut value = characteristic
            .read()
            .await
            .map_err(|e| HubError::read_failed(&uuid, e))?;
        value.truncate(protocol::MAX_READ_LEN);
        trace!("Read {} -> [{}]", uuid, to_hex(&value));
        Ok(value)
    }

    /// Runs a detector pass over `ports` now and waits for it.
    pub async fn detect_devices(&self, ports: &[Port]) -> Vec<Device> {
        DeviceDetector::new(self.clone()).run(ports).await
    }

    fn spawn_detector(&self, delay: Duration, ports: Vec<Port>) {
        let detector = DeviceDetector::new(self.clone());
        tokio::spawn(async move {
            detector.run_after(delay, &ports).await;
        });
    }

    /// Sends the setup frame for a passively confirmed device once the
    /// port has settled.
    fn spawn_configure(&self, port: Port, device_type: DeviceType) {
        let session = self.clone();
        let mut cancel = self.cancellation();
        let settle = Duration::from_millis(self.inner.detector_settings.settle_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(settle) => {}
                _ = cancel.changed() => return,
            }
            let frame = protocol::setup_frame(port, device_type, device_type.default_mode());
            match session
                .write_characteristic(protocol::INPUT_COMMAND_UUID, &frame)
                .await
            {
                Ok(()) => debug!("Port {}: configured {}", port, device_type),
                Err(e) => warn!("Port {}: could not configure {}: {}", port, device_type, e),
            }
        });
    }

    fn handle_notification(&self, uuid: &str, data: &[u8]) {
        trace!("Notification {} -> [{}]", uuid, to_hex(data));
        match uuid {
            protocol::BATTERY_LEVEL_UUID => self.handle_battery(data),
            protocol::PORT_INFO_UUID => self.handle_port_message(data),
            protocol::SENSOR_VALUES_UUID => self.handle_sensor_value(data),
            protocol::FIRMWARE_CHAR_UUID => debug!("Firmware notification: [{}]", to_hex(data)),
            other => debug!("Unhandled notification on {}", other),
        }
    }

    fn handle_battery(&self, data: &[u8]) {
        let Some(&level) = data.first() else {
            return;
        };
        if let Some(info) = self.inner.lock_hub_info().as_mut() {
            info.battery = Some(level);
            info.last_updated = Some(SystemTime::now());
        }
        debug!("Battery: {}%", level);
        self.inner.events.publish(HubEvent::Battery(level));
    }

    fn handle_port_message(&self, data: &[u8]) {
        let Some(event) = parse_port_message(data) else {
            return;
        };
        let registry = &self.inner.registry;

        match event.kind {
            PortEventKind::Attached(Some(device_type)) => {
                info!("Port {}: {} attached", event.port, device_type);
                registry.upsert(
                    Device::new(event.port, device_type).with_mode(device_type.default_mode()),
                );
                self.spawn_configure(event.port, device_type);
            }
            PortEventKind::Attached(None) => {
                info!("Port {}: device attached, identity unknown", event.port);
                if self.inner.detector_settings.enabled {
                    let settle = Duration::from_millis(self.inner.detector_settings.settle_ms);
                    self.spawn_detector(settle, vec![event.port]);
                }
            }
            PortEventKind::Detached => {
                if registry.mark_disconnected(event.port) {
                    info!("Port {}: device detached", event.port);
                } else {
                    debug!("Port {}: detach for unknown device", event.port);
                }
            }
        }
    }

    fn handle_sensor_value(&self, data: &[u8]) {
        let Some(port) = data.get(1).and_then(|&id| Port::try_from(id).ok()) else {
            return;
        };
        let Some(device) = self
            .inner
            .registry
            .get(port)
            .filter(|d| d.connected && d.device_type.is_sensor())
        else {
            trace!("Sensor value for port {} without a sensor", port);
            return;
        };
        if let Some(value) = protocol::decode_sensor_value(data, port) {
            self.inner.registry.upsert(device.with_value(value));
        }
    }
}

impl SessionInner {
    fn read_link(&self) -> std::sync::RwLockReadGuard<'_, LinkState> {
        self.link.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_link(&self) -> std::sync::RwLockWriteGuard<'_, LinkState> {
        self.link.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_hub_info(&self) -> std::sync::MutexGuard<'_, Option<HubInfo>> {
        self.hub_info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn characteristic(&self, uuid: &str) -> Result<Arc<dyn BleCharacteristic>, HubError> {
        let link = self.read_link();
        if link.status != ConnectionStatus::Connected {
            return Err(HubError::NotConnected);
        }
        link.characteristics
            .get(uuid)
            .cloned()
            .ok_or_else(|| HubError::UnknownCharacteristic(uuid.to_string()))
    }

    /// Keeps fields that notifications filled in while the reads ran.
    fn merge_hub_info(&self, read: HubInfo) {
        let merged = {
            let mut current = self.lock_hub_info();
            let Some(current) = current.as_mut() else {
                return;
            };
            let battery = read.battery.or(current.battery);
            *current = HubInfo { battery, ..read };
            current.clone()
        };
        info!("Hub info:\n{}", merged);
        self.events.publish(HubEvent::HubInfo(merged));
    }

    /// Returns to Disconnected after a connect attempt that never reached
    /// Connected.
    fn abandon_connect(&self, generation: u64) {
        let mut link = self.write_link();
        if *self.generation.borrow() == generation && link.status == ConnectionStatus::Connecting {
            link.status = ConnectionStatus::Disconnected;
        }
    }

    /// Clears all connection state. Returns the peripheral to close, if any.
    fn teardown(&self, reason: &str) -> Option<Arc<dyn BlePeripheral>> {
        let (previous, peripheral, tasks) = {
            let mut link = self.write_link();
            if link.status == ConnectionStatus::Disconnected {
                // Nothing to close, but a scan or detector pass may be running
                drop(link);
                self.generation.send_modify(|g| *g += 1);
                debug!("No connection to drop ({}); pending work cancelled", reason);
                return None;
            }
            let previous = link.status;
            link.status = ConnectionStatus::Disconnected;
            link.characteristics.clear();
            (
                previous,
                link.peripheral.take(),
                std::mem::take(&mut link.tasks),
            )
        };

        self.generation.send_modify(|g| *g += 1);
        for task in tasks {
            task.abort();
        }
        *self.lock_hub_info() = None;
        for device in self.registry.list_connected() {
            self.registry.mark_disconnected(device.port);
        }

        info!("Disconnected ({})", reason);
        if previous == ConnectionStatus::Connected {
            self.events.publish(HubEvent::Connection(false));
        }
        peripheral
    }
}

async fn close_peripheral(peripheral: &Arc<dyn BlePeripheral>) {
    if let Err(e) = peripheral.disconnect().await {
        warn!("Error closing connection to {}: {}", peripheral.address(), e);
    }
}

fn spawn_notification_drain(
    session: Weak<SessionInner>,
    uuid: &'static str,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            let Some(inner) = session.upgrade() else {
                break;
            };
            HubSession { inner }.handle_notification(uuid, &data);
        }
        trace!("Notification stream for {} ended", uuid);
    })
}

fn spawn_link_watcher(
    session: Weak<SessionInner>,
    mut link: watch::Receiver<bool>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while link.changed().await.is_ok() {
            if *link.borrow_and_update() {
                continue;
            }
            if let Some(inner) = session.upgrade() {
                if *inner.generation.borrow() == generation {
                    warn!("Link to hub lost");
                    inner.teardown("link lost");
                }
            }
            break;
        }
    })
}
