//! WinRT Transport
//!
//! [`GattTransport`] over `Windows.Devices.Bluetooth`.
//!
//! - [`scanner`] - advertisement watcher, first match wins
//! - [`connection`] - link, GATT lookup and characteristic I/O

pub mod connection;
pub mod scanner;

use crate::domain::models::{CharacteristicDescriptor, DiscoveredDevice, PeripheralHandle};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportConfig, TransportEvent};
use async_trait::async_trait;
use connection::BleConnection;
use scanner::BleScanner;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;
use windows::Devices::Bluetooth::BluetoothAdapter;

pub struct WinrtTransport {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    scanner: BleScanner,
    connection: Mutex<Option<Arc<BleConnection>>>,
    generation: Arc<AtomicU64>,
}

impl WinrtTransport {
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            config,
            events,
            scanner: BleScanner::new(),
            connection: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<BleConnection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn linked(&self) -> Result<Arc<BleConnection>, TransportError> {
        self.lock().clone().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl GattTransport for WinrtTransport {
    async fn start_adapter(&self) -> Result<(), TransportError> {
        let unavailable = |e: windows::core::Error| TransportError::AdapterUnavailable(e.to_string());
        let adapter = BluetoothAdapter::GetDefaultAsync()
            .map_err(unavailable)?
            .await
            .map_err(unavailable)?;
        if !adapter.IsLowEnergySupported().map_err(unavailable)? {
            return Err(TransportError::AdapterUnavailable(
                "adapter does not support Bluetooth LE".into(),
            ));
        }
        info!("BLE adapter ready");
        Ok(())
    }

    async fn scan(&self, service: Uuid) -> Result<DiscoveredDevice, TransportError> {
        self.scanner
            .find_first(service, self.config.scan_timeout)
            .await
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let existing = self.lock().clone();
        if let Some(connection) = existing {
            if connection.is_connected() {
                debug!("Reusing link to {}", handle);
                self.generation.store(handle.generation(), Ordering::SeqCst);
                return Ok(());
            }
            connection.close();
        }

        let address = scanner::parse_address(handle.id()).ok_or_else(|| {
            TransportError::ConnectFailed(format!("invalid address {}", handle.id()))
        })?;
        self.generation.store(handle.generation(), Ordering::SeqCst);

        let connection = tokio::time::timeout(
            self.config.connect_timeout,
            BleConnection::open(address, self.events.clone(), self.generation.clone()),
        )
        .await
        .map_err(|_| TransportError::ConnectFailed("connection timed out".into()))??;

        *self.lock() = Some(Arc::new(connection));
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<CharacteristicDescriptor>, TransportError> {
        self.linked()?.discover(self.config.service.service).await
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.linked()?.read(uuid).await
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.linked()?.write(uuid, value).await
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        self.linked()?.subscribe(uuid).await
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.scanner.stop();
        let connection = self.lock().take();
        if let Some(connection) = connection {
            info!("Disconnecting from device");
            connection.close();
        }
        Ok(())
    }

    async fn close(&self) {
        let _ = self.disconnect().await;
    }
}
