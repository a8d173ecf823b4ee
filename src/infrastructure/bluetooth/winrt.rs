//! WinRT BLE backend
//!
//! Implements the adapter traits on top of `Windows.Devices.Bluetooth`.

use crate::infrastructure::bluetooth::adapter::{
    format_address, parse_address, AdapterError, Advertisement, BleAdapter, BleCharacteristic,
    BlePeripheral,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

fn platform(e: windows::core::Error) -> AdapterError {
    AdapterError::Platform(e.message().to_string())
}

fn communication(status: GattCommunicationStatus) -> AdapterError {
    match status {
        GattCommunicationStatus::Unreachable => AdapterError::Disconnected,
        other => AdapterError::Communication(format!("{:?}", other)),
    }
}

/// Lower-case dashed form of a GUID, matching the protocol constants.
fn guid_to_string(guid: &GUID) -> String {
    let d4 = guid.data4;
    format!(
        "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid.data1, guid.data2, guid.data3, d4[0], d4[1], d4[2], d4[3], d4[4], d4[5], d4[6], d4[7]
    )
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// BLE adapter backed by the default Windows radio
#[derive(Default)]
pub struct WinRtAdapter {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
}

impl WinRtAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_watcher(
        &self,
        sender: mpsc::UnboundedSender<Advertisement>,
    ) -> windows::core::Result<BluetoothLEAdvertisementWatcher> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let _ = sender.send(Advertisement {
                        name,
                        address: format_address(args.BluetoothAddress()?),
                        rssi: args.RawSignalStrengthInDBm()?,
                    });
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        Ok(watcher)
    }
}

#[async_trait]
impl BleAdapter for WinRtAdapter {
    async fn start_scan(&self) -> Result<mpsc::UnboundedReceiver<Advertisement>, AdapterError> {
        self.stop_scan().await?;
        info!("Starting BLE advertisement watcher");

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = self.start_watcher(tx).map_err(platform)?;
        *self.watcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(watcher);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), AdapterError> {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            info!("Stopping BLE advertisement watcher");
            watcher.Stop().map_err(platform)?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        advertisement: &Advertisement,
    ) -> Result<Arc<dyn BlePeripheral>, AdapterError> {
        let address = parse_address(&advertisement.address).ok_or_else(|| {
            AdapterError::Platform(format!("invalid address {}", advertisement.address))
        })?;

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        info!("Device opened: {:?}", device.Name().map(|n| n.to_string()));

        let (link_tx, _) = watch::channel(true);
        let link = Arc::new(link_tx);
        let status_link = link.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if let Ok(status) = dev.ConnectionStatus() {
                        status_link.send_replace(status == BluetoothConnectionStatus::Connected);
                    }
                }
                Ok(())
            });
        device
            .ConnectionStatusChanged(&status_handler)
            .map_err(platform)?;

        Ok(Arc::new(WinRtPeripheral {
            device,
            address: advertisement.address.clone(),
            link,
        }))
    }
}

struct WinRtPeripheral {
    device: BluetoothLEDevice,
    address: String,
    link: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BlePeripheral for WinRtPeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn discover_characteristics(
        &self,
    ) -> Result<Vec<Arc<dyn BleCharacteristic>>, AdapterError> {
        let services_result = self
            .device
            .GetGattServicesAsync()
            .map_err(platform)?
            .await
            .map_err(platform)?;
        let status = services_result.Status().map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(communication(status));
        }

        let services = services_result.Services().map_err(platform)?;
        let mut found: Vec<Arc<dyn BleCharacteristic>> = Vec::new();
        for i in 0..services.Size().map_err(platform)? {
            let service = services.GetAt(i).map_err(platform)?;
            let service_uuid = guid_to_string(&service.Uuid().map_err(platform)?);

            let chars_result = service
                .GetCharacteristicsAsync()
                .map_err(platform)?
                .await
                .map_err(platform)?;
            if chars_result.Status().map_err(platform)? != GattCommunicationStatus::Success {
                warn!("Could not list characteristics of service {}", service_uuid);
                continue;
            }

            let characteristics = chars_result.Characteristics().map_err(platform)?;
            for j in 0..characteristics.Size().map_err(platform)? {
                let characteristic = characteristics.GetAt(j).map_err(platform)?;
                let uuid = guid_to_string(&characteristic.Uuid().map_err(platform)?);
                debug!("Service {} characteristic {}", service_uuid, uuid);
                found.push(Arc::new(WinRtCharacteristic {
                    inner: characteristic,
                    uuid,
                    service_uuid: service_uuid.clone(),
                }));
            }
        }
        Ok(found)
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }

    async fn disconnect(&self) -> Result<(), AdapterError> {
        self.device.Close().map_err(platform)?;
        self.link.send_replace(false);
        Ok(())
    }
}

struct WinRtCharacteristic {
    inner: GattCharacteristic,
    uuid: String,
    service_uuid: String,
}

#[async_trait]
impl BleCharacteristic for WinRtCharacteristic {
    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    fn service_uuid(&self) -> String {
        self.service_uuid.clone()
    }

    async fn read(&self) -> Result<Vec<u8>, AdapterError> {
        let result = self
            .inner
            .ReadValueAsync()
            .map_err(platform)?
            .await
            .map_err(platform)?;
        let status = result.Status().map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(communication(status));
        }
        buffer_to_vec(&result.Value().map_err(platform)?).map_err(platform)
    }

    async fn write(&self, data: &[u8]) -> Result<(), AdapterError> {
        let writer = DataWriter::new().map_err(platform)?;
        writer.WriteBytes(data).map_err(platform)?;
        let buffer = writer.DetachBuffer().map_err(platform)?;

        let status = self
            .inner
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse)
            .map_err(platform)?
            .await
            .map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(communication(status));
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, AdapterError> {
        let status = self
            .inner
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(platform)?
            .await
            .map_err(platform)?;
        if status != GattCommunicationStatus::Success {
            return Err(communication(status));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(bytes) = args.CharacteristicValue().and_then(|v| buffer_to_vec(&v)) {
                        let _ = tx.send(bytes);
                    }
                }
                Ok(())
            },
        );
        self.inner.ValueChanged(&handler).map_err(platform)?;
        Ok(rx)
    }
}
