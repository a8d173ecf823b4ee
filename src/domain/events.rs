//! Observer list for hub change notifications.
//!
//! Delivery is synchronous and best-effort: each observer is invoked in the
//! publishing task, and channel observers whose receiver was dropped are
//! pruned on the next publish. Observers run without the list locked, so a
//! callback may subscribe or publish again.

use crate::domain::models::{Device, HubEvent, HubInfo};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Observer = Arc<dyn Fn(&HubEvent) -> bool + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<Observer>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receive every event through an unbounded channel.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Arc::new(move |event| tx.send(event.clone()).is_ok()));
        rx
    }

    pub fn on_battery(&self, callback: impl Fn(u8) + Send + Sync + 'static) {
        self.push(Arc::new(move |event| {
            if let HubEvent::Battery(level) = event {
                callback(*level);
            }
            true
        }));
    }

    pub fn on_hub_info(&self, callback: impl Fn(&HubInfo) + Send + Sync + 'static) {
        self.push(Arc::new(move |event| {
            if let HubEvent::HubInfo(info) = event {
                callback(info);
            }
            true
        }));
    }

    pub fn on_device(&self, callback: impl Fn(&Device) + Send + Sync + 'static) {
        self.push(Arc::new(move |event| {
            if let HubEvent::Device(device) = event {
                callback(device);
            }
            true
        }));
    }

    pub fn on_connection(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.push(Arc::new(move |event| {
            if let HubEvent::Connection(connected) = event {
                callback(*connected);
            }
            true
        }));
    }

    pub fn publish(&self, event: HubEvent) {
        let snapshot = self.lock().clone();
        let dead: Vec<Observer> = snapshot
            .into_iter()
            .filter(|observer| !observer(&event))
            .collect();
        if !dead.is_empty() {
            self.lock()
                .retain(|observer| !dead.iter().any(|d| Arc::ptr_eq(d, observer)));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, observer: Observer) {
        self.lock().push(observer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_callbacks_filter_by_kind() {
        let bus = EventBus::new();
        let battery = Arc::new(AtomicU32::new(0));
        let connections = Arc::new(AtomicU32::new(0));

        let b = battery.clone();
        bus.on_battery(move |level| {
            b.store(level as u32, Ordering::SeqCst);
        });
        let c = connections.clone();
        bus.on_connection(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(HubEvent::Battery(42));
        bus.publish(HubEvent::Connection(true));
        bus.publish(HubEvent::Connection(false));

        assert_eq!(battery.load(Ordering::SeqCst), 42);
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        drop(rx);
        let mut live = bus.subscribe();

        bus.publish(HubEvent::Battery(10));

        assert_eq!(bus.observers.lock().unwrap().len(), 1);
        assert!(matches!(live.try_recv(), Ok(HubEvent::Battery(10))));
    }

    #[test]
    fn test_callback_may_use_the_bus() {
        let bus = EventBus::new();
        let late = Arc::new(Mutex::new(None));

        let inner = bus.clone();
        let slot = late.clone();
        bus.on_connection(move |connected| {
            if connected {
                *slot.lock().unwrap() = Some(inner.subscribe());
                inner.publish(HubEvent::Battery(77));
            }
        });

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let publisher = bus.clone();
        std::thread::spawn(move || {
            publisher.publish(HubEvent::Connection(true));
            let _ = done_tx.send(());
        });
        done_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .expect("publish did not return");

        bus.publish(HubEvent::Battery(5));
        let mut rx = late.lock().unwrap().take().unwrap();
        // Subscribed during the first publish: sees the nested event and later ones.
        assert!(matches!(rx.try_recv(), Ok(HubEvent::Battery(77))));
        assert!(matches!(rx.try_recv(), Ok(HubEvent::Battery(5))));
    }
}
