//! Active device detection
//!
//! Used when port notifications leave a port without a confirmed device.
//! Each candidate type is tried in turn: setup frame, settle, then either a
//! short actuation (motor, piezo) or a sensor read that must echo the port.
//!
//! The hub accepts setup and actuator frames whether or not the device is
//! present, so an empty port can be reported as a motor or piezo. Sensors
//! are only confirmed by their echo.

use crate::domain::models::{mode, Device, DeviceType, Port};
use crate::domain::settings::DetectorSettings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::service::HubSession;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const PORT_A_CANDIDATES: [DeviceType; 4] = [
    DeviceType::Motor,
    DeviceType::TiltSensor,
    DeviceType::MotionSensor,
    DeviceType::Piezo,
];

const PORT_B_CANDIDATES: [DeviceType; 4] = [
    DeviceType::TiltSensor,
    DeviceType::MotionSensor,
    DeviceType::Motor,
    DeviceType::Piezo,
];

/// Raw speed byte used for the motor test pulse.
const TEST_MOTOR_SPEED: u8 = 0x05;
const TEST_TONE_HZ: u16 = 440;
const TEST_TONE_MS: u16 = 50;
/// Green
const TEST_LED_COLOR: (u8, u8, u8) = (0x00, 0xFF, 0x00);

/// Types probed on `port`, in order.
pub fn candidates(port: Port) -> &'static [DeviceType] {
    match port {
        Port::A => &PORT_A_CANDIDATES,
        Port::B => &PORT_B_CANDIDATES,
        Port::Light => &[DeviceType::RgbLight],
    }
}

/// The session went away mid-pass.
#[derive(Debug)]
struct Cancelled;

pub struct DeviceDetector {
    session: HubSession,
    settings: DetectorSettings,
    cancel: watch::Receiver<u64>,
}

impl DeviceDetector {
    pub fn new(session: HubSession) -> Self {
        let settings = session.detector_settings().clone();
        let cancel = session.cancellation();
        Self {
            session,
            settings,
            cancel,
        }
    }

    /// Waits `delay`, then runs [`DeviceDetector::run`].
    pub async fn run_after(mut self, delay: Duration, ports: &[Port]) -> Vec<Device> {
        if self.pause(delay).await.is_err() {
            debug!("Detector pass cancelled before it started");
            return Vec::new();
        }
        self.run(ports).await
    }

    /// Probes every port in `ports` that has no connected device. Returns
    /// the devices found.
    pub async fn run(mut self, ports: &[Port]) -> Vec<Device> {
        let mut found = Vec::new();
        if !self.session.is_connected() {
            return found;
        }

        let registry = self.session.registry();
        let mut probed_any = false;
        for &port in ports {
            if let Some(device) = registry.get(port).filter(|d| d.connected) {
                debug!("Port {}: {} already known, not probing", port, device.name);
                continue;
            }
            if probed_any && self.pause_ms(self.settings.port_gap_ms).await.is_err() {
                break;
            }
            probed_any = true;

            match self.detect_port(port).await {
                Ok(Some(device)) => found.push(device),
                Ok(None) => info!("Port {}: no device found", port),
                Err(Cancelled) => {
                    info!("Device detection cancelled");
                    break;
                }
            }
        }
        found
    }

    async fn detect_port(&mut self, port: Port) -> Result<Option<Device>, Cancelled> {
        info!("Port {}: probing for devices", port);
        if port == Port::Light {
            return self.probe_light().await;
        }

        for (i, &candidate) in candidates(port).iter().enumerate() {
            if i > 0 {
                self.pause_ms(self.settings.candidate_gap_ms).await?;
            }
            debug!("Port {}: trying {}", port, candidate);
            let probe = if candidate.is_actuator() {
                self.probe_actuator(port, candidate).await?
            } else {
                self.probe_sensor(port, candidate).await?
            };
            if let Some(device) = probe {
                self.still_connected()?;
                info!("Port {}: detected {}", port, device.device_type);
                self.session.registry().upsert(device.clone());
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    async fn setup(&mut self, port: Port, device_type: DeviceType, mode: u8) -> bool {
        let frame = protocol::setup_frame(port, device_type, mode);
        match self
            .session
            .write_characteristic(protocol::INPUT_COMMAND_UUID, &frame)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("Port {}: setup for {} rejected: {}", port, device_type, e);
                false
            }
        }
    }

    async fn probe_sensor(
        &mut self,
        port: Port,
        device_type: DeviceType,
    ) -> Result<Option<Device>, Cancelled> {
        let mode = device_type.default_mode();
        if !self.setup(port, device_type, mode).await {
            return Ok(None);
        }
        self.pause_ms(self.settings.settle_ms).await?;
        self.pause_ms(self.settings.sensor_read_ms).await?;

        let frame = match self
            .session
            .read_characteristic(protocol::SENSOR_VALUES_UUID)
            .await
        {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Port {}: sensor read failed: {}", port, e);
                return Ok(None);
            }
        };
        if !protocol::echoes_port(&frame, port) {
            debug!(
                "Port {}: no {} echo in [{}]",
                port,
                device_type,
                protocol::to_hex(&frame)
            );
            return Ok(None);
        }

        let device = Device::new(port, device_type).with_mode(mode);
        Ok(Some(match protocol::decode_sensor_value(&frame, port) {
            Some(value) => device.with_value(value),
            None => device,
        }))
    }

    async fn probe_actuator(
        &mut self,
        port: Port,
        device_type: DeviceType,
    ) -> Result<Option<Device>, Cancelled> {
        let mode = device_type.default_mode();
        if !self.setup(port, device_type, mode).await {
            return Ok(None);
        }
        self.pause_ms(self.settings.settle_ms).await?;

        let (test, stop) = match device_type {
            DeviceType::Piezo => (
                protocol::piezo_tone_frame(port, TEST_TONE_HZ, TEST_TONE_MS),
                protocol::stop_tone_frame(port),
            ),
            _ => (
                vec![port.id(), 0x01, 0x01, TEST_MOTOR_SPEED],
                protocol::motor_stop_frame(port),
            ),
        };

        let accepted = match self
            .session
            .write_characteristic(protocol::OUTPUT_COMMAND_UUID, &test)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                debug!("Port {}: test actuation rejected: {}", port, e);
                false
            }
        };
        if accepted {
            self.pause_ms(self.settings.actuation_ms).await?;
        }
        if let Err(e) = self
            .session
            .write_characteristic(protocol::OUTPUT_COMMAND_UUID, &stop)
            .await
        {
            warn!("Port {}: could not stop test actuation: {}", port, e);
        }

        Ok(accepted.then(|| Device::new(port, device_type).with_mode(mode)))
    }

    /// Port 6 is the hub's own LED; only the mode needs finding out.
    async fn probe_light(&mut self) -> Result<Option<Device>, Cancelled> {
        let port = Port::Light;
        let mut mode = mode::LED_RGB;
        if !self.setup(port, DeviceType::RgbLight, mode).await {
            mode = mode::LED_INDEX;
            if !self.setup(port, DeviceType::RgbLight, mode).await {
                warn!("Port {}: LED setup rejected in both modes", port);
            }
        }
        self.pause_ms(self.settings.settle_ms).await?;

        let (r, g, b) = TEST_LED_COLOR;
        if let Err(e) = self
            .session
            .write_characteristic(
                protocol::OUTPUT_COMMAND_UUID,
                &protocol::led_color_frame(r, g, b),
            )
            .await
        {
            info!("Port {}: LED test colour rejected: {}", port, e);
            return Ok(None);
        }
        self.pause_ms(self.settings.actuation_ms).await?;
        if let Err(e) = self
            .session
            .write_characteristic(
                protocol::OUTPUT_COMMAND_UUID,
                &protocol::led_color_frame(0, 0, 0),
            )
            .await
        {
            warn!("Port {}: could not turn LED off: {}", port, e);
        }

        self.still_connected()?;
        let device = Device::new(port, DeviceType::RgbLight).with_mode(mode);
        info!("Port {}: detected {}", port, device.device_type);
        self.session.registry().upsert(device.clone());
        Ok(Some(device))
    }

    /// A GATT call may have completed after the session was torn down.
    fn still_connected(&self) -> Result<(), Cancelled> {
        if self.cancel.has_changed().unwrap_or(true) || !self.session.is_connected() {
            return Err(Cancelled);
        }
        Ok(())
    }

    async fn pause_ms(&mut self, ms: u64) -> Result<(), Cancelled> {
        self.pause(Duration::from_millis(ms)).await
    }

    async fn pause(&mut self, duration: Duration) -> Result<(), Cancelled> {
        if self.cancel.has_changed().unwrap_or(true) {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.changed() => Err(Cancelled),
        }
    }
}
