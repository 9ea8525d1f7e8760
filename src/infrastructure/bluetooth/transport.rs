//! Radio abstraction consumed by the session state machine.

use crate::domain::models::{CharacteristicDescriptor, DiscoveredDevice, PeripheralHandle};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{ServiceDescriptor, CAPSENSE_LED_SERVICE};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Unsolicited callbacks from the radio.
///
/// `generation` is the one carried by the handle the link was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peripheral dropped the link
    LinkLost { generation: u64 },
    /// A subscribed characteristic pushed a new value
    ValueChanged {
        generation: u64,
        uuid: Uuid,
        value: Vec<u8>,
    },
}

/// Configuration shared by all transports
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub service: ServiceDescriptor,
    /// Give up scanning after this long without a match
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service: CAPSENSE_LED_SERVICE,
            scan_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Platform BLE radio, central role, one peripheral at a time.
///
/// Every method may be called concurrently; implementations never block the
/// calling thread. State changes the caller did not ask for are surfaced as
/// [`TransportEvent`]s on the sender the transport was built with.
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Acquire the radio
    async fn start_adapter(&self) -> Result<(), TransportError>;

    /// Scan for the first device advertising `service`, then stop scanning
    async fn scan(&self, service: Uuid) -> Result<DiscoveredDevice, TransportError>;

    /// Open a link. Connecting to the device that is already linked reuses the link.
    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError>;

    /// Characteristics of the configured service
    async fn discover_services(&self) -> Result<Vec<CharacteristicDescriptor>, TransportError>;

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Write with response. No read-back.
    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError>;

    /// Enable notifications; values arrive as [`TransportEvent::ValueChanged`]
    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError>;

    /// Drop the link and stop any scan. Idempotent.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Release the radio. Idempotent.
    async fn close(&self);
}
