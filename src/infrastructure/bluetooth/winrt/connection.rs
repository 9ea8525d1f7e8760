//! BLE Connection Module
//!
//! Handles the link to the peripheral and GATT access to the CapSense/LED
//! service.

use crate::domain::models::{CharacteristicDescriptor, CharacteristicProperties};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::TransportEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus, GattSession,
    GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

const SUBSCRIBE_ATTEMPTS: u32 = 3;

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn properties_of(flags: GattCharacteristicProperties) -> CharacteristicProperties {
    let has = |flag: GattCharacteristicProperties| (flags & flag).0 != 0;
    CharacteristicProperties {
        read: has(GattCharacteristicProperties::Read),
        write: has(GattCharacteristicProperties::Write)
            || has(GattCharacteristicProperties::WriteWithoutResponse),
        notify: has(GattCharacteristicProperties::Notify)
            || has(GattCharacteristicProperties::Indicate),
    }
}

/// An open link to the peripheral
pub struct BleConnection {
    device: BluetoothLEDevice,
    /// Kept alive so Windows maintains the link between GATT calls
    session: Option<GattSession>,
    characteristics: Mutex<HashMap<Uuid, GattCharacteristic>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    generation: Arc<AtomicU64>,
    open: Arc<AtomicBool>,
}

impl BleConnection {
    /// Connect to a device by Bluetooth address.
    ///
    /// A drop of the link is reported as [`TransportEvent::LinkLost`] with
    /// the generation current at that time.
    pub async fn open(
        address: u64,
        events: mpsc::UnboundedSender<TransportEvent>,
        generation: Arc<AtomicU64>,
    ) -> Result<Self, TransportError> {
        info!("Connecting to Bluetooth device: {:#X}", address);
        let connect_failed = |e: windows::core::Error| TransportError::ConnectFailed(e.to_string());

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(connect_failed)?
            .await
            .map_err(connect_failed)?;
        info!("Device connected: {:?}", device.Name());

        let session = match Self::create_gatt_session(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession, continuing anyway: {}", e);
                None
            }
        };

        let open = Arc::new(AtomicBool::new(true));
        let sender = events.clone();
        let link_open = open.clone();
        let link_generation = generation.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected
                        && link_open.swap(false, Ordering::SeqCst)
                    {
                        warn!("Peripheral dropped the link");
                        let _ = sender.send(TransportEvent::LinkLost {
                            generation: link_generation.load(Ordering::SeqCst),
                        });
                    }
                }
                Ok(())
            });
        device
            .ConnectionStatusChanged(&status_handler)
            .map_err(connect_failed)?;

        Ok(Self {
            device,
            session,
            characteristics: Mutex::new(HashMap::new()),
            events,
            generation,
            open,
        })
    }

    /// Create a GattSession to maintain the BLE connection
    async fn create_gatt_session(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .device
                .ConnectionStatus()
                .map(|s| s == BluetoothConnectionStatus::Connected)
                .unwrap_or(false)
    }

    /// Look up `service` and cache its characteristics
    pub async fn discover(
        &self,
        service: Uuid,
    ) -> Result<Vec<CharacteristicDescriptor>, TransportError> {
        let failed = |e: windows::core::Error| TransportError::Discovery(e.to_string());

        let services_result = self
            .device
            .GetGattServicesForUuidWithCacheModeAsync(to_guid(service), BluetoothCacheMode::Uncached)
            .map_err(failed)?
            .await
            .map_err(failed)?;
        let status = services_result.Status().map_err(failed)?;
        if status != GattCommunicationStatus::Success {
            error!("Failed to get GATT services: {:?}", status);
            return Err(TransportError::Discovery(format!("status {:?}", status)));
        }

        let services = services_result.Services().map_err(failed)?;
        if services.Size().map_err(failed)? == 0 {
            return Err(TransportError::Discovery("service not found".into()));
        }
        let gatt_service = services.GetAt(0).map_err(failed)?;

        let chars_result = gatt_service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(failed)?
            .await
            .map_err(failed)?;
        if chars_result.Status().map_err(failed)? != GattCommunicationStatus::Success {
            return Err(TransportError::Discovery("failed to get characteristics".into()));
        }

        let characteristics = chars_result.Characteristics().map_err(failed)?;
        info!("Found {} characteristics", characteristics.Size().map_err(failed)?);

        let mut found = HashMap::new();
        let mut descriptors = Vec::new();
        for i in 0..characteristics.Size().map_err(failed)? {
            let c = characteristics.GetAt(i).map_err(failed)?;
            let uuid = to_uuid(c.Uuid().map_err(failed)?);
            descriptors.push(CharacteristicDescriptor {
                uuid,
                properties: properties_of(c.CharacteristicProperties().map_err(failed)?),
            });
            found.insert(uuid, c);
        }

        *self.lock() = found;
        Ok(descriptors)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic, TransportError> {
        self.lock()
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let failed = |e: windows::core::Error| TransportError::Read(e.to_string());
        let characteristic = self.characteristic(uuid)?;

        let result = characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(failed)?
            .await
            .map_err(failed)?;
        let status = result.Status().map_err(failed)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Read(format!("status {:?}", status)));
        }
        buffer_bytes(&result.Value().map_err(failed)?).map_err(failed)
    }

    pub async fn write(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let failed = |e: windows::core::Error| TransportError::Write(e.to_string());
        let characteristic = self.characteristic(uuid)?;

        let writer = DataWriter::new().map_err(failed)?;
        writer.WriteBytes(value).map_err(failed)?;
        let buffer = writer.DetachBuffer().map_err(failed)?;

        let status = characteristic
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)
            .map_err(failed)?
            .await
            .map_err(failed)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Write(format!("status {:?}", status)));
        }
        Ok(())
    }

    /// Enable notifications with retry logic
    pub async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let characteristic = self.characteristic(uuid)?;

        let sender = self.events.clone();
        let generation = self.generation.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = buffer_bytes(&args.CharacteristicValue()?)?;
                    let _ = sender.send(TransportEvent::ValueChanged {
                        generation: generation.load(Ordering::SeqCst),
                        uuid,
                        value,
                    });
                }
                Ok(())
            },
        );
        characteristic
            .ValueChanged(&handler)
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        for attempt in 1..=SUBSCRIBE_ATTEMPTS {
            let outcome = match characteristic.WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            ) {
                Ok(operation) => operation.await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(GattCommunicationStatus::Success) => {
                    info!("Notifications enabled for {}", uuid);
                    return Ok(());
                }
                Ok(status) => {
                    warn!("Notification subscription returned status: {:?}", status);
                }
                Err(e) => {
                    warn!("Notification subscription attempt {} failed: {}", attempt, e);
                }
            }
            if attempt < SUBSCRIBE_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        error!("Failed to enable notifications after {} attempts", SUBSCRIBE_ATTEMPTS);
        Err(TransportError::Subscribe(format!(
            "no success after {SUBSCRIBE_ATTEMPTS} attempts"
        )))
    }

    /// Release the link. No [`TransportEvent::LinkLost`] is reported for it.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.lock().clear();
        if let Some(session) = &self.session {
            let _ = session.Close();
        }
        if let Err(e) = self.device.Close() {
            warn!("Failed to close device: {}", e);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, GattCharacteristic>> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
