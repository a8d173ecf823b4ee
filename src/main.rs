//! `wedo-hub`: command-line front end for a LEGO WeDo 2.0 Smart Hub.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use wedo_hub::domain::models::ConnectionStatus;
use wedo_hub::domain::settings::SettingsService;
use wedo_hub::infrastructure::bluetooth::adapter::BleAdapter;
use wedo_hub::infrastructure::bluetooth::fake::FakeHub;
use wedo_hub::infrastructure::bluetooth::protocol;
use wedo_hub::infrastructure::logging::init_logger;
use wedo_hub::{Device, DeviceManager, DeviceType, HubSession, LedColor, Port};

#[derive(Parser, Debug)]
#[command(name = "wedo-hub")]
#[command(author, version, about = "Control a LEGO WeDo 2.0 Smart Hub over Bluetooth LE", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Hub address (AA:BB:CC:DD:EE:FF). Defaults to the last hub used,
    /// then to the first hub found by a scan
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Settings file to use instead of the per-user one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Talk to an in-process simulated hub instead of the radio
    #[arg(long, global = true)]
    simulate: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List hubs in range
    Scan {
        /// Scan duration in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Connect and print hub metadata and attached devices
    Info,

    /// Drive a motor
    Motor {
        #[arg(short, long, value_parser = parse_port, default_value = "1")]
        port: Port,

        /// Power in percent, -100..=100; 0 stops the motor
        #[arg(allow_negative_numbers = true)]
        power: i32,

        /// Run time before stopping
        #[arg(short, long, default_value_t = 1000)]
        duration_ms: u64,
    },

    /// Set the built-in light
    Led {
        /// Palette colour name (red, green, blue, ...)
        #[arg(conflicts_with = "rgb")]
        color: Option<LedColor>,

        /// Explicit colour as R,G,B
        #[arg(long, value_parser = parse_rgb)]
        rgb: Option<(u8, u8, u8)>,
    },

    /// Play a tone on the piezo
    Tone {
        #[arg(short, long, value_parser = parse_port, default_value = "1")]
        port: Port,

        #[arg(short, long, default_value_t = 440)]
        frequency: u16,

        #[arg(short, long, default_value_t = 500)]
        duration_ms: u16,
    },

    /// Read a sensor
    Sensor {
        #[arg(short, long, value_parser = parse_port, default_value = "1")]
        port: Port,

        /// Switch the sensor to this mode before reading
        #[arg(short, long)]
        mode: Option<u8>,
    },

    /// Write a raw frame to a characteristic
    Send {
        /// Payload as hex, e.g. "01 01 01 3a"
        frame: String,

        /// Target characteristic
        #[arg(short, long, default_value = protocol::OUTPUT_COMMAND_UUID)]
        uuid: String,
    },

    /// Probe the ports for devices the hub did not announce
    Detect {
        /// Ports to probe; all of them when omitted
        #[arg(value_parser = parse_port)]
        ports: Vec<Port>,
    },
}

fn parse_port(s: &str) -> Result<Port, String> {
    match s.to_lowercase().as_str() {
        "1" | "a" => Ok(Port::A),
        "2" | "b" => Ok(Port::B),
        "6" | "light" | "led" => Ok(Port::Light),
        other => Err(format!("unknown port '{}' (expected 1, 2 or 6)", other)),
    }
}

fn parse_rgb(s: &str) -> Result<(u8, u8, u8), String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u8>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [r, g, b] => Ok((*r, *g, *b)),
        _ => Err("expected R,G,B".to_string()),
    }
}

/// The simulated hub announces a motor on port 1 and the light; the tilt
/// sensor on port 2 is only found by probing.
fn simulated_hub() -> FakeHub {
    let hub = FakeHub::new();
    hub.attach_silently(Port::B, DeviceType::TiltSensor);
    hub
}

fn populate_simulated_hub(hub: &FakeHub) {
    hub.attach(Port::Light, DeviceType::RgbLight);
    hub.attach(Port::A, DeviceType::Motor);
}

#[cfg(windows)]
fn radio_adapter() -> Result<Arc<dyn BleAdapter>> {
    Ok(Arc::new(
        wedo_hub::infrastructure::bluetooth::winrt::WinRtAdapter::new(),
    ))
}

#[cfg(not(windows))]
fn radio_adapter() -> Result<Arc<dyn BleAdapter>> {
    bail!("No Bluetooth backend on this platform; run with --simulate")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings_service = match &args.config {
        Some(path) => SettingsService::from_path(path.clone()),
        None => SettingsService::new()?,
    };
    if args.verbose {
        settings_service.get_mut().logging.level = "debug".to_string();
    }
    let _log_guard = init_logger(&settings_service.get().logging)?;
    debug!("Settings from {}", settings_service.path().display());

    let simulated = args.simulate.then(simulated_hub);
    let adapter: Arc<dyn BleAdapter> = match &simulated {
        Some(hub) => Arc::new(hub.clone()),
        None => radio_adapter()?,
    };

    let session = HubSession::new(adapter, settings_service.get());

    if let Command::Scan { timeout_ms } = &args.command {
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| settings_service.get().scan.timeout());
        let hubs = session.scan(timeout).await?;
        if hubs.is_empty() {
            println!("No hubs found");
        }
        for hub in hubs {
            println!("{}  {:<20} {} dBm", hub.address, hub.name, hub.rssi);
        }
        return Ok(());
    }

    let address = resolve_address(&args, &session, &settings_service).await?;
    info!("Connecting to {}", address);
    session
        .connect(&address)
        .await
        .with_context(|| format!("Could not connect to {}", address))?;
    match &simulated {
        Some(hub) => populate_simulated_hub(hub),
        None => {
            if let Err(e) = settings_service.remember_hub(&address) {
                warn!("Could not save settings: {}", e);
            }
        }
    }

    let manager = DeviceManager::new(session.clone());
    let result = run_command(&args.command, &manager).await;

    if let Err(e) = manager.stop_all().await {
        warn!("Stopping devices failed: {}", e);
    }
    session.disconnect().await;
    result
}

async fn resolve_address(
    args: &Args,
    session: &HubSession,
    settings_service: &SettingsService,
) -> Result<String> {
    if let Some(address) = &args.address {
        return Ok(address.clone());
    }
    if !args.simulate {
        if let Some(address) = &settings_service.get().last_connected_address {
            return Ok(address.clone());
        }
    }
    let hubs = session.scan(settings_service.get().scan.timeout()).await?;
    match hubs.into_iter().next() {
        Some(hub) => Ok(hub.address),
        None => bail!("No hub found; switch the hub on or pass --address"),
    }
}

async fn run_command(command: &Command, manager: &DeviceManager) -> Result<()> {
    let session = manager.session();
    match command {
        // Handled before connecting
        Command::Scan { .. } => {}
        Command::Info => {
            // Give the hub a moment to announce its ports
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Some(hub_info) = session.hub_info() {
                println!("{}", hub_info);
            }
            let devices = session.registry().list_connected();
            if devices.is_empty() {
                println!("No devices attached");
            }
            for device in devices {
                println!("Port {}: {}", device.port, device.device_type);
            }
            println!("Characteristics:");
            for uuid in session.characteristic_uuids() {
                println!("  {}", uuid);
            }
        }
        Command::Motor {
            port,
            power,
            duration_ms,
        } => {
            ensure_device(manager, *port, DeviceType::Motor).await?;
            manager
                .set_motor_power_and_wait(*port, *power, Duration::from_millis(*duration_ms))
                .await?;
        }
        Command::Led { color, rgb } => {
            ensure_device(manager, Port::Light, DeviceType::RgbLight).await?;
            match (color, rgb) {
                (Some(color), _) => manager.set_led_index(Port::Light, *color).await?,
                (None, Some((r, g, b))) => manager.set_led_color(Port::Light, *r, *g, *b).await?,
                (None, None) => bail!("Give a colour name or --rgb R,G,B"),
            }
            // Keep the link up long enough for the colour to be seen
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Command::Tone {
            port,
            frequency,
            duration_ms,
        } => {
            ensure_device(manager, *port, DeviceType::Piezo).await?;
            manager
                .play_tone_and_wait(*port, *frequency, *duration_ms)
                .await?;
        }
        Command::Sensor { port, mode } => {
            let device = ensure_any_device(manager, *port).await?;
            if !device.device_type.is_sensor() {
                bail!("Port {} has a {}, not a sensor", port, device.device_type);
            }
            if let Some(mode) = mode {
                manager.configure_sensor(*port, *mode).await?;
            }
            let value = manager.read_sensor(*port).await?;
            println!("Port {} ({}): {}", port, device.device_type, value);
        }
        Command::Send { frame, uuid } => {
            let data = protocol::parse_hex(frame).map_err(anyhow::Error::msg)?;
            session.write_characteristic(uuid, &data).await?;
            println!("Wrote {} to {}", protocol::to_hex(&data), uuid);
        }
        Command::Detect { ports } => {
            let ports = if ports.is_empty() {
                Port::ALL.to_vec()
            } else {
                ports.clone()
            };
            let found = session.detect_devices(&ports).await;
            if found.is_empty() {
                println!("Nothing new found");
            }
            for device in found {
                println!("Port {}: {} (probed)", device.port, device.device_type);
            }
            for device in session.registry().list_connected() {
                println!("Port {}: {}", device.port, device.device_type);
            }
        }
    }
    Ok(())
}

/// Waits briefly for the hub to announce `port`, then falls back to a
/// probe of that port alone.
async fn ensure_any_device(manager: &DeviceManager, port: Port) -> Result<Device> {
    let session = manager.session();
    for _ in 0..10 {
        if let Some(device) = session.registry().get(port).filter(|d| d.connected) {
            return Ok(device);
        }
        if session.status() != ConnectionStatus::Connected {
            bail!("Hub disconnected");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Port {} not announced, probing", port);
    session.detect_devices(&[port]).await;
    session
        .registry()
        .get(port)
        .filter(|d| d.connected)
        .with_context(|| format!("No device found on port {}", port))
}

async fn ensure_device(manager: &DeviceManager, port: Port, expected: DeviceType) -> Result<()> {
    let device = ensure_any_device(manager, port).await?;
    if device.device_type != expected {
        bail!(
            "Port {} has a {}, expected a {}",
            port,
            device.device_type,
            expected
        );
    }
    Ok(())
}
