//! Port-addressed device operations
//!
//! Thin layer over [`HubSession::write_characteristic`] that checks the
//! registry before sending anything.

use crate::domain::models::{mode, Device, DeviceType, DeviceValue, LedColor, Port};
use crate::infrastructure::bluetooth::error::HubError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::HubSession;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DeviceManager {
    session: HubSession,
    /// Pending timed stops, one per motor port
    stop_timers: Arc<Mutex<HashMap<Port, JoinHandle<()>>>>,
}

impl DeviceManager {
    pub fn new(session: HubSession) -> Self {
        Self {
            session,
            stop_timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn session(&self) -> &HubSession {
        &self.session
    }

    /// Connected device of `expected` type on `port`.
    fn require(&self, port: Port, expected: DeviceType) -> Result<Device, HubError> {
        if !self.session.is_connected() {
            return Err(HubError::NotConnected);
        }
        let registry = self.session.registry();
        registry
            .connected_of_type(port, expected)
            .ok_or_else(|| HubError::UnrecognizedDevice {
                port,
                expected,
                found: registry
                    .get(port)
                    .filter(|d| d.connected)
                    .map(|d| d.device_type),
            })
    }

    /// Connected sensor on `port`.
    fn require_sensor(&self, port: Port) -> Result<Device, HubError> {
        if !self.session.is_connected() {
            return Err(HubError::NotConnected);
        }
        let device = self.session.registry().get(port).filter(|d| d.connected);
        match device {
            Some(device) if device.device_type.is_sensor() => Ok(device),
            other => Err(HubError::NotASensor {
                port,
                found: other.map(|d| d.device_type),
            }),
        }
    }

    /// Any later motor command on `port` replaces an earlier timed stop.
    fn cancel_stop_timer(&self, port: Port) {
        let timer = self
            .stop_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    async fn output(&self, frame: &[u8]) -> Result<(), HubError> {
        self.session
            .write_characteristic(protocol::OUTPUT_COMMAND_UUID, frame)
            .await
    }

    async fn input(&self, frame: &[u8]) -> Result<(), HubError> {
        self.session
            .write_characteristic(protocol::INPUT_COMMAND_UUID, frame)
            .await
    }

    /// Sets motor power in percent (clamped to ±100). A non-zero `duration`
    /// schedules a stop in the background.
    pub async fn set_motor_power(
        &self,
        port: Port,
        power: i32,
        duration: Duration,
    ) -> Result<(), HubError> {
        self.require(port, DeviceType::Motor)?;
        self.cancel_stop_timer(port);
        info!("Port {}: motor power {}%", port, power);
        self.output(&protocol::motor_power_frame(port, power)).await?;

        if !duration.is_zero() {
            let manager = self.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(e) = manager.output(&protocol::motor_stop_frame(port)).await {
                    warn!("Port {}: timed motor stop failed: {}", port, e);
                }
            });
            self.stop_timers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(port, timer);
        }
        Ok(())
    }

    /// Runs the motor for `duration`, then stops it.
    pub async fn set_motor_power_and_wait(
        &self,
        port: Port,
        power: i32,
        duration: Duration,
    ) -> Result<(), HubError> {
        self.set_motor_power(port, power, Duration::ZERO).await?;
        tokio::time::sleep(duration).await;
        self.stop_motor(port).await
    }

    pub async fn stop_motor(&self, port: Port) -> Result<(), HubError> {
        self.require(port, DeviceType::Motor)?;
        self.cancel_stop_timer(port);
        self.output(&protocol::motor_stop_frame(port)).await
    }

    pub async fn set_led_color(&self, port: Port, red: u8, green: u8, blue: u8) -> Result<(), HubError> {
        self.require(port, DeviceType::RgbLight)?;
        let setup = protocol::setup_frame(port, DeviceType::RgbLight, mode::LED_RGB);
        if let Err(e) = self.input(&setup).await {
            warn!("Port {}: LED RGB setup failed: {}", port, e);
        }
        info!("Port {}: LED colour ({}, {}, {})", port, red, green, blue);
        self.output(&protocol::led_color_frame(red, green, blue)).await
    }

    /// Sets the LED to a palette colour.
    pub async fn set_led_index(&self, port: Port, color: LedColor) -> Result<(), HubError> {
        self.require(port, DeviceType::RgbLight)?;
        let setup = protocol::setup_frame(port, DeviceType::RgbLight, mode::LED_INDEX);
        if let Err(e) = self.input(&setup).await {
            warn!("Port {}: LED index setup failed: {}", port, e);
        }
        info!("Port {}: LED colour {:?}", port, color);
        self.output(&protocol::led_index_frame(color.index())).await
    }

    pub async fn play_tone(&self, port: Port, frequency: u16, duration_ms: u16) -> Result<(), HubError> {
        self.require(port, DeviceType::Piezo)?;
        info!("Port {}: tone {} Hz for {} ms", port, frequency, duration_ms);
        self.output(&protocol::piezo_tone_frame(port, frequency, duration_ms))
            .await
    }

    /// Plays a tone and returns once its duration has elapsed.
    pub async fn play_tone_and_wait(
        &self,
        port: Port,
        frequency: u16,
        duration_ms: u16,
    ) -> Result<(), HubError> {
        self.play_tone(port, frequency, duration_ms).await?;
        tokio::time::sleep(Duration::from_millis(duration_ms as u64)).await;
        Ok(())
    }

    /// Silences `port`. Only needs a connection; silencing is always safe.
    pub async fn stop_tone(&self, port: Port) -> Result<(), HubError> {
        if !self.session.is_connected() {
            return Err(HubError::NotConnected);
        }
        self.output(&protocol::stop_tone_frame(port)).await
    }

    /// Reads the current value of the sensor on `port` and records it.
    pub async fn read_sensor(&self, port: Port) -> Result<DeviceValue, HubError> {
        let device = self.require_sensor(port)?;

        let frame = self
            .session
            .read_characteristic(protocol::SENSOR_VALUES_UUID)
            .await?;
        let value = protocol::decode_sensor_value(&frame, port).ok_or_else(|| {
            debug!(
                "Port {}: no value in [{}]",
                port,
                protocol::to_hex(&frame)
            );
            HubError::UnrecognizedDevice {
                port,
                expected: device.device_type,
                found: None,
            }
        })?;

        self.session.registry().upsert(device.with_value(value.clone()));
        Ok(value)
    }

    /// Switches the sensor on `port` to `mode`.
    pub async fn configure_sensor(&self, port: Port, mode: u8) -> Result<(), HubError> {
        let device = self.require_sensor(port)?;

        self.input(&protocol::setup_frame(port, device.device_type, mode))
            .await?;
        info!("Port {}: {} set to mode {}", port, device.device_type, mode);
        self.session.registry().upsert(device.with_mode(mode));
        Ok(())
    }

    /// Stops every connected motor and silences every piezo. Keeps going
    /// past individual failures and returns the first one.
    pub async fn stop_all(&self) -> Result<(), HubError> {
        if !self.session.is_connected() {
            return Err(HubError::NotConnected);
        }
        let mut first_error = None;
        for device in self.session.registry().list_connected() {
            let frame = match device.device_type {
                DeviceType::Motor => {
                    self.cancel_stop_timer(device.port);
                    protocol::motor_stop_frame(device.port)
                }
                DeviceType::Piezo => protocol::stop_tone_frame(device.port),
                _ => continue,
            };
            if let Err(e) = self.output(&frame).await {
                warn!("Port {}: stop failed: {}", device.port, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::settings::Settings;
    use crate::infrastructure::bluetooth::fake::{FakeHub, FAKE_HUB_ADDRESS};
    use std::sync::Arc;

    fn manager(hub: &FakeHub) -> DeviceManager {
        let mut settings = Settings::default();
        settings.detector.enabled = false;
        DeviceManager::new(HubSession::new(Arc::new(hub.clone()), &settings))
    }

    async fn connected_with(hub: &FakeHub, devices: &[(Port, DeviceType)]) -> DeviceManager {
        let manager = manager(hub);
        manager.session().connect(FAKE_HUB_ADDRESS).await.unwrap();
        for &(port, device_type) in devices {
            manager
                .session()
                .registry()
                .upsert(Device::new(port, device_type));
        }
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_power_single_write() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::Motor)]).await;

        manager
            .set_motor_power(Port::A, 50, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x01, 0x01, 0x01, 0x3A]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_power_while_disconnected() {
        let hub = FakeHub::new();
        let manager = manager(&hub);

        assert_eq!(
            manager.set_motor_power(Port::A, 50, Duration::ZERO).await,
            Err(HubError::NotConnected)
        );
        assert!(hub.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_motor_stops_in_background() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::B, DeviceType::Motor)]).await;

        manager
            .set_motor_power(Port::B, -100, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(hub.writes_to(protocol::OUTPUT_COMMAND_UUID).len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x02, 0x01, 0x01, 0x9C], vec![0x02, 0x01, 0x01, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_and_wait() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::Motor)]).await;
        let start = tokio::time::Instant::now();

        manager
            .set_motor_power_and_wait(Port::A, 100, Duration::from_secs(2))
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x01, 0x01, 0x01, 0x64], vec![0x01, 0x01, 0x01, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_device_type() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::TiltSensor)]).await;

        assert_eq!(
            manager.set_motor_power(Port::A, 10, Duration::ZERO).await,
            Err(HubError::UnrecognizedDevice {
                port: Port::A,
                expected: DeviceType::Motor,
                found: Some(DeviceType::TiltSensor),
            })
        );
        assert_eq!(
            manager.play_tone(Port::B, 440, 100).await,
            Err(HubError::UnrecognizedDevice {
                port: Port::B,
                expected: DeviceType::Piezo,
                found: None,
            })
        );
        assert!(hub.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_led_color_ignores_setup_failure() {
        let hub = FakeHub::new();
        hub.fail_writes_when(|uuid, _| uuid == protocol::INPUT_COMMAND_UUID);
        let manager = connected_with(&hub, &[(Port::Light, DeviceType::RgbLight)]).await;

        manager.set_led_color(Port::Light, 255, 0, 128).await.unwrap();

        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x06, 0x04, 0x03, 0xFF, 0x00, 0x80]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_led_index() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::Light, DeviceType::RgbLight)]).await;

        manager.set_led_index(Port::Light, LedColor::Red).await.unwrap();

        assert_eq!(
            hub.writes_to(protocol::INPUT_COMMAND_UUID),
            vec![protocol::setup_frame(Port::Light, DeviceType::RgbLight, mode::LED_INDEX).to_vec()]
        );
        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x06, 0x04, 0x01, 0x09]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tone_and_wait_then_stop() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::B, DeviceType::Piezo)]).await;
        let start = tokio::time::Instant::now();

        manager.play_tone_and_wait(Port::B, 1000, 250).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        manager.stop_tone(Port::B).await.unwrap();

        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![
                vec![0x02, 0x02, 0x04, 0xE8, 0x03, 0xFA, 0x00],
                vec![0x02, 0x03, 0x00],
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_sensor_records_value() {
        let hub = FakeHub::new();
        hub.set_value(protocol::SENSOR_VALUES_UUID, vec![0x05, 0x02, 0x02, 0x34, 0x12]);
        let manager = connected_with(&hub, &[(Port::B, DeviceType::MotionSensor)]).await;

        let value = manager.read_sensor(Port::B).await.unwrap();

        assert_eq!(value, DeviceValue::U16(0x1234));
        assert_eq!(
            manager.session().registry().get(Port::B).unwrap().last_value,
            Some(DeviceValue::U16(0x1234))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_sensor_updates_mode() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::TiltSensor)]).await;

        manager.configure_sensor(Port::A, mode::TILT_CRASH).await.unwrap();

        assert_eq!(
            manager.session().registry().get(Port::A).unwrap().mode(),
            Some(mode::TILT_CRASH)
        );
        assert_eq!(
            hub.writes_to(protocol::INPUT_COMMAND_UUID),
            vec![protocol::setup_frame(Port::A, DeviceType::TiltSensor, 2).to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let hub = FakeHub::new();
        let manager = connected_with(
            &hub,
            &[
                (Port::A, DeviceType::Motor),
                (Port::B, DeviceType::Piezo),
                (Port::Light, DeviceType::RgbLight),
            ],
        )
        .await;

        manager.stop_all().await.unwrap();

        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![vec![0x01, 0x01, 0x01, 0x00], vec![0x02, 0x03, 0x00]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_motor_command_replaces_timed_stop() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::Motor)]).await;

        manager
            .set_motor_power(Port::A, 50, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        hub.clear_writes();
        manager
            .set_motor_power(Port::A, 80, Duration::ZERO)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            hub.writes_to(protocol::OUTPUT_COMMAND_UUID),
            vec![protocol::motor_power_frame(Port::A, 80)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_operations_report_what_is_attached() {
        let hub = FakeHub::new();
        let manager = connected_with(&hub, &[(Port::A, DeviceType::Motor)]).await;

        assert_eq!(
            manager.read_sensor(Port::A).await,
            Err(HubError::NotASensor {
                port: Port::A,
                found: Some(DeviceType::Motor),
            })
        );
        assert_eq!(
            manager.configure_sensor(Port::B, mode::TILT_ANGLE).await,
            Err(HubError::NotASensor {
                port: Port::B,
                found: None,
            })
        );
        assert!(hub.writes().is_empty());
    }
}
