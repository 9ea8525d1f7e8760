//! BLE Scanner Module
//!
//! Finds the first device advertising the CapSense/LED service using the
//! WinRT advertisement watcher.

use crate::domain::models::DiscoveredDevice;
use crate::error::TransportError;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// Colon-separated hex form of a 48-bit Bluetooth address
pub fn format_address(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xFF))
        .collect::<Vec<_>>()
        .join(":")
}

/// Inverse of [`format_address`]
pub fn parse_address(address: &str) -> Option<u64> {
    let digits: String = address.split(':').collect();
    if digits.len() != 12 {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

/// BLE Scanner for the CapSense/LED peripheral
#[derive(Default)]
pub struct BleScanner {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
}

impl BleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan until a device advertising `service` shows up or `timeout` expires.
    ///
    /// The watcher is stopped before returning either way.
    pub async fn find_first(
        &self,
        service: Uuid,
        timeout: Duration,
    ) -> Result<DiscoveredDevice, TransportError> {
        self.stop();
        info!("Starting BLE scan for service UUID: {}", service);

        let (sender, mut found) = mpsc::unbounded_channel();
        let watcher = Self::start_watcher(GUID::from_u128(service.as_u128()), sender)
            .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
        *self.lock() = Some(watcher);

        let result = tokio::time::timeout(timeout, found.recv()).await;
        self.stop();

        match result {
            Ok(Some(device)) => {
                info!("Found {} ({:?})", device.address, device.name);
                Ok(device)
            }
            _ => {
                info!("No peripheral advertising {} found", service);
                Err(TransportError::NotFound)
            }
        }
    }

    fn start_watcher(
        target: GUID,
        sender: mpsc::UnboundedSender<DiscoveredDevice>,
    ) -> windows::core::Result<BluetoothLEAdvertisementWatcher> {
        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;

                    let mut matches = false;
                    for i in 0..service_uuids.Size()? {
                        if service_uuids.GetAt(i)? == target {
                            matches = true;
                            break;
                        }
                    }

                    if matches {
                        let name = adv.LocalName()?.to_string();
                        let address = args.BluetoothAddress()?;
                        let rssi = args.RawSignalStrengthInDBm()?;

                        let _ = sender.send(DiscoveredDevice {
                            id: format_address(address),
                            address: format_address(address),
                            name: (!name.is_empty()).then_some(name),
                            rssi: Some(rssi),
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        Ok(watcher)
    }

    /// Stop scanning. Does nothing when no scan is running.
    pub fn stop(&self) {
        if let Some(watcher) = self.lock().take() {
            debug!("Stopping BLE scan...");
            if let Err(e) = watcher.Stop() {
                warn!("Failed to stop advertisement watcher: {}", e);
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
