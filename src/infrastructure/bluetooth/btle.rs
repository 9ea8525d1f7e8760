//! btleplug Transport
//!
//! [`GattTransport`] over the host's BLE stack through `btleplug`
//! (BlueZ on Linux, CoreBluetooth on macOS).

use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicProperties, DiscoveredDevice, PeripheralHandle,
};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportConfig, TransportEvent};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    adapter: Option<Adapter>,
    /// Peripherals returned by scans, keyed by [`DiscoveredDevice::id`]
    found: HashMap<String, Peripheral>,
    linked: Option<Peripheral>,
    link_watcher: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<()>>,
}

pub struct BtleplugTransport {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Arc<Mutex<Inner>>,
    /// Generation of the handle the current link was opened with
    generation: Arc<AtomicU64>,
}

impl BtleplugTransport {
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(Inner::default())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn adapter(&self) -> Result<Adapter, TransportError> {
        let existing = self.lock().adapter.clone();
        if let Some(adapter) = existing {
            return Ok(adapter);
        }
        self.start_adapter().await?;
        self.lock()
            .adapter
            .clone()
            .ok_or_else(|| TransportError::AdapterUnavailable("adapter released".into()))
    }

    fn linked(&self) -> Result<Peripheral, TransportError> {
        self.lock().linked.clone().ok_or(TransportError::NotConnected)
    }

    fn characteristic(
        &self,
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == self.config.service.service)
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    /// Report `DeviceDisconnected` for the linked peripheral as a link loss
    async fn watch_link(&self, adapter: &Adapter) -> Result<(), TransportError> {
        let mut central_events = adapter
            .events()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let inner = self.inner.clone();
        let generation = self.generation.clone();
        let sender = self.events.clone();

        let watcher = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };
                let lost = {
                    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                    let ours = inner.linked.as_ref().is_some_and(|p| p.id() == id);
                    if ours {
                        inner.linked = None;
                        if let Some(task) = inner.notifications.take() {
                            task.abort();
                        }
                    }
                    ours
                };
                if lost {
                    warn!("Peripheral {:?} disconnected", id);
                    let _ = sender.send(TransportEvent::LinkLost {
                        generation: generation.load(Ordering::SeqCst),
                    });
                }
            }
            debug!("Adapter event stream ended");
        });

        let previous = self.lock().link_watcher.replace(watcher);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Forward notifications of `peripheral` as [`TransportEvent::ValueChanged`]
    async fn forward_notifications(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let generation = self.generation.clone();
        let sender = self.events.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let _ = sender.send(TransportEvent::ValueChanged {
                    generation: generation.load(Ordering::SeqCst),
                    uuid: notification.uuid,
                    value: notification.value,
                });
            }
        });

        let previous = self.lock().notifications.replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }
}

fn properties_of(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl GattTransport for BtleplugTransport {
    async fn start_adapter(&self) -> Result<(), TransportError> {
        if self.lock().adapter.is_some() {
            return Ok(());
        }

        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::AdapterUnavailable("no BLE adapter found".into()))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using BLE adapter {}", info);
        }
        self.watch_link(&adapter).await?;
        self.lock().adapter = Some(adapter);
        Ok(())
    }

    async fn scan(&self, service: Uuid) -> Result<DiscoveredDevice, TransportError> {
        let adapter = self.adapter().await?;
        let mut central_events = adapter
            .events()
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;

        info!("Starting BLE scan for service UUID: {}", service);
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;

        let search = async {
            while let Some(event) = central_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                if properties.services.contains(&service) {
                    return Some((peripheral, properties));
                }
            }
            None
        };
        let found = tokio::time::timeout(self.config.scan_timeout, search).await;

        if let Err(e) = adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        let Ok(Some((peripheral, properties))) = found else {
            info!("No peripheral advertising {} found", service);
            return Err(TransportError::NotFound);
        };

        let device = DiscoveredDevice {
            id: format!("{:?}", peripheral.id()),
            address: peripheral.address().to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
        };
        info!("Found {} ({:?})", device.address, device.name);
        self.lock().found.insert(device.id.clone(), peripheral);
        Ok(device)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self
            .lock()
            .found
            .get(handle.id())
            .cloned()
            .ok_or_else(|| TransportError::ConnectFailed(format!("{} was never scanned", handle)))?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if connected {
            debug!("Reusing link to {}", handle);
        } else {
            info!("Connecting to {}", handle);
            let attempt = tokio::time::timeout(self.config.connect_timeout, peripheral.connect())
                .await
                .map_err(|_| TransportError::ConnectFailed("connection timed out".into()))
                .and_then(|r| r.map_err(|e| TransportError::ConnectFailed(e.to_string())));
            if let Err(e) = attempt {
                // A timed out attempt may still complete in the stack.
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        }

        self.generation.store(handle.generation(), Ordering::SeqCst);
        self.lock().linked = Some(peripheral.clone());
        if let Err(e) = self.forward_notifications(&peripheral).await {
            warn!("Dropping link to {}: {}", handle, e);
            self.disconnect().await?;
            return Err(TransportError::ConnectFailed(e.to_string()));
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<CharacteristicDescriptor>, TransportError> {
        let peripheral = self.linked()?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == self.config.service.service)
            .ok_or_else(|| TransportError::Discovery("service not found".into()))?;
        info!("Found {} characteristics", service.characteristics.len());

        Ok(service
            .characteristics
            .into_iter()
            .map(|c| CharacteristicDescriptor {
                uuid: c.uuid,
                properties: properties_of(c.properties),
            })
            .collect())
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.linked()?;
        let characteristic = self.characteristic(&peripheral, uuid)?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| TransportError::Read(e.to_string()))
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.linked()?;
        let characteristic = self.characteristic(&peripheral, uuid)?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        let peripheral = self.linked()?;
        let characteristic = self.characteristic(&peripheral, uuid)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        info!("Notifications enabled for {}", uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let (peripheral, adapter) = {
            let mut inner = self.lock();
            if let Some(task) = inner.notifications.take() {
                task.abort();
            }
            (inner.linked.take(), inner.adapter.clone())
        };

        if let Some(adapter) = adapter {
            let _ = adapter.stop_scan().await;
        }
        let Some(peripheral) = peripheral else {
            return Ok(());
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Disconnecting from {}", peripheral.address());
            peripheral
                .disconnect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.disconnect().await {
            warn!("Disconnect during close failed: {}", e);
        }
        let mut inner = self.lock();
        if let Some(task) = inner.link_watcher.take() {
            task.abort();
        }
        inner.found.clear();
        inner.adapter = None;
    }
}
