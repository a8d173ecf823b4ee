pub mod bluetooth;
pub mod device_manager;
pub mod logging;
