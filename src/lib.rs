//! Protocol engine for the LEGO WeDo 2.0 Smart Hub.
//!
//! [`HubSession`] owns the BLE connection and keeps a [`DeviceRegistry`] of
//! what is plugged into the hub; [`DeviceManager`] drives motors, the light
//! and the piezo on top of it.

pub mod domain;
pub mod infrastructure;

pub use domain::events::EventBus;
pub use domain::models::{Device, DeviceType, DeviceValue, HubEvent, HubInfo, LedColor, Port};
pub use domain::registry::DeviceRegistry;
pub use infrastructure::bluetooth::{HubError, HubSession};
pub use infrastructure::device_manager::DeviceManager;
