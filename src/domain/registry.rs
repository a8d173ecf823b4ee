use crate::domain::events::EventBus;
use crate::domain::models::{Device, DeviceType, HubEvent, Port};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

/// Port-addressed store of confirmed devices.
///
/// Every mutation replaces the whole record and publishes exactly one
/// [`HubEvent::Device`]. Changes are queued while the map is locked and
/// published in that order, so observers see the same sequence the map went
/// through.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<Port, Device>>,
    pending: Mutex<VecDeque<Device>>,
    delivering: AtomicBool,
    events: Arc<EventBus>,
}

/// Clears the delivering flag even if an observer panics.
struct Delivering<'a>(&'a AtomicBool);

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeviceRegistry {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            events,
        }
    }

    pub fn upsert(&self, device: Device) {
        {
            let mut devices = self.write();
            debug!(
                "Registry upsert: port {} -> {} (connected: {})",
                device.port, device.name, device.connected
            );
            devices.insert(device.port, device.clone());
            self.queue(device);
        }
        self.deliver();
    }

    /// Marks the device on `port` as detached. Returns false when the port
    /// never had a record.
    pub fn mark_disconnected(&self, port: Port) -> bool {
        {
            let mut devices = self.write();
            let Some(device) = devices.get_mut(&port) else {
                return false;
            };
            *device = device.disconnected();
            debug!("Registry: port {} -> {} detached", port, device.name);
            self.queue(device.clone());
        }
        self.deliver();
        true
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Port, Device>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with the map write-locked.
    fn queue(&self, device: Device) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(device);
    }

    fn next_pending(&self) -> Option<Device> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Publishes queued changes. Whoever is already delivering, including
    /// this thread one level up from an observer, drains the queue instead.
    fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            {
                let _flag = Delivering(&self.delivering);
                while let Some(device) = self.next_pending() {
                    self.events.publish(HubEvent::Device(device));
                }
            }
            let empty = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty();
            if empty {
                return;
            }
        }
    }

    pub fn get(&self, port: Port) -> Option<Device> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned()
    }

    pub fn list_connected(&self) -> Vec<Device> {
        let mut connected: Vec<Device> = self
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| d.connected)
            .cloned()
            .collect();
        connected.sort_by_key(|d| d.port);
        connected
    }

    pub fn list_by_type(&self, device_type: DeviceType) -> Vec<Device> {
        self.list_connected()
            .into_iter()
            .filter(|d| d.device_type == device_type)
            .collect()
    }

    /// Connected device of the given type on `port`, if any.
    pub fn connected_of_type(&self, port: Port, device_type: DeviceType) -> Option<Device> {
        self.get(port)
            .filter(|d| d.connected && d.device_type == device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry_with_counter() -> (DeviceRegistry, Arc<AtomicUsize>) {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on_device(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (DeviceRegistry::new(bus), count)
    }

    #[test]
    fn test_upsert_replaces_record_and_notifies_once() {
        let (registry, count) = registry_with_counter();

        registry.upsert(Device::new(Port::A, DeviceType::Motor));
        registry.upsert(Device::new(Port::A, DeviceType::TiltSensor));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            registry.get(Port::A).map(|d| d.device_type),
            Some(DeviceType::TiltSensor)
        );
        assert_eq!(registry.list_connected().len(), 1);
    }

    #[test]
    fn test_list_connected_skips_detached() {
        let (registry, _) = registry_with_counter();
        registry.upsert(Device::new(Port::A, DeviceType::Motor));
        registry.upsert(Device::new(Port::B, DeviceType::MotionSensor));

        assert!(registry.mark_disconnected(Port::A));

        let connected = registry.list_connected();
        assert_eq!(connected.len(), 1);
        assert!(connected.iter().all(|d| d.connected));
        // Record is kept, only flagged.
        assert_eq!(registry.get(Port::A).map(|d| d.connected), Some(false));
    }

    #[test]
    fn test_mark_disconnected_unknown_port_is_silent() {
        let (registry, count) = registry_with_counter();
        assert!(!registry.mark_disconnected(Port::B));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(registry.get(Port::B).is_none());
    }

    #[test]
    fn test_list_by_type() {
        let (registry, _) = registry_with_counter();
        registry.upsert(Device::new(Port::A, DeviceType::Motor));
        registry.upsert(Device::new(Port::B, DeviceType::Motor));
        registry.upsert(Device::new(Port::Light, DeviceType::RgbLight));
        registry.mark_disconnected(Port::B);

        let motors = registry.list_by_type(DeviceType::Motor);
        assert_eq!(motors.len(), 1);
        assert_eq!(motors[0].port, Port::A);
        assert!(registry
            .connected_of_type(Port::Light, DeviceType::RgbLight)
            .is_some());
        assert!(registry
            .connected_of_type(Port::Light, DeviceType::Motor)
            .is_none());
    }

    #[test]
    fn test_detach_never_restores_an_older_record() {
        for _ in 0..2000 {
            let registry = Arc::new(DeviceRegistry::new(EventBus::new()));
            let last_seen = Arc::new(Mutex::new(None));
            let seen = last_seen.clone();
            registry.events.on_device(move |device| {
                *seen.lock().unwrap() = Some(device.clone());
            });
            registry.upsert(Device::new(Port::A, DeviceType::Motor));

            let barrier = Arc::new(std::sync::Barrier::new(2));
            let detach = {
                let (registry, barrier) = (registry.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.mark_disconnected(Port::A);
                })
            };
            let attach = {
                let (registry, barrier) = (registry.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.upsert(Device::new(Port::A, DeviceType::TiltSensor));
                })
            };
            detach.join().unwrap();
            attach.join().unwrap();

            let stored = registry.get(Port::A).unwrap();
            assert_eq!(stored.device_type, DeviceType::TiltSensor);
            // The last notification matches what ended up stored.
            assert_eq!(last_seen.lock().unwrap().as_ref(), Some(&stored));
        }
    }

    #[test]
    fn test_observer_may_write_back() {
        let bus = EventBus::new();
        let registry = Arc::new(DeviceRegistry::new(bus.clone()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&registry);
        let log = order.clone();
        bus.on_device(move |device| {
            log.lock().unwrap().push((device.port, device.connected));
            // A motor on port 1 always comes with the light.
            if device.port == Port::A && device.connected {
                if let Some(registry) = weak.upgrade() {
                    registry.upsert(Device::new(Port::Light, DeviceType::RgbLight));
                }
            }
        });

        registry.upsert(Device::new(Port::A, DeviceType::Motor));
        registry.mark_disconnected(Port::A);

        assert_eq!(
            *order.lock().unwrap(),
            vec![(Port::A, true), (Port::Light, true), (Port::A, false)]
        );
        assert_eq!(registry.list_connected().len(), 1);
    }
}
