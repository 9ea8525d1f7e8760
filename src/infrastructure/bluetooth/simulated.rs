//! Simulated Peripheral
//!
//! In-memory stand-in for a CapSense/LED board, used by `--simulate` and by
//! the session tests. [`SimulatedPeripheral`] is the control panel: it can
//! hide the radio, script one-shot failures, hold reads in flight, push
//! CapSense touches and pull the plug mid-session.

use crate::domain::models::{
    CharacteristicDescriptor, CharacteristicProperties, DiscoveredDevice, PeripheralHandle,
};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::{
    self, CAPSENSE_CHAR_UUID, CAPSENSE_NO_TOUCH, LED_CHAR_UUID,
};
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportConfig, TransportEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Transport calls, as recorded by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartAdapter,
    Scan,
    Connect,
    DiscoverServices,
    Read,
    Write,
    Subscribe,
    Disconnect,
    Close,
}

const DEVICE_ID: &str = "sim-capsense-led";
const DEVICE_ADDRESS: &str = "00:A0:50:C5:1E:D0";

#[derive(Debug)]
struct PeripheralModel {
    adapter_present: bool,
    advertising: bool,
    /// Generation of the open link, if any
    link: Option<u64>,
    subscribed: HashSet<Uuid>,
    values: HashMap<Uuid, Vec<u8>>,
    characteristics: Vec<CharacteristicDescriptor>,
    fail_next: HashSet<Operation>,
    calls: Vec<Operation>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl Default for PeripheralModel {
    fn default() -> Self {
        let values = HashMap::from([
            (LED_CHAR_UUID, protocol::encode_led(false).to_vec()),
            (CAPSENSE_CHAR_UUID, CAPSENSE_NO_TOUCH.to_le_bytes().to_vec()),
        ]);
        let characteristics = vec![
            CharacteristicDescriptor {
                uuid: LED_CHAR_UUID,
                properties: CharacteristicProperties {
                    read: true,
                    write: true,
                    notify: false,
                },
            },
            CharacteristicDescriptor {
                uuid: CAPSENSE_CHAR_UUID,
                properties: CharacteristicProperties {
                    read: true,
                    write: false,
                    notify: true,
                },
            },
        ];
        Self {
            adapter_present: true,
            advertising: true,
            link: None,
            subscribed: HashSet::new(),
            values,
            characteristics,
            fail_next: HashSet::new(),
            calls: Vec::new(),
            events: None,
        }
    }
}

impl PeripheralModel {
    fn record(&mut self, op: Operation) -> bool {
        self.calls.push(op);
        self.fail_next.remove(&op)
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Control panel of the simulated board
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    model: Arc<Mutex<PeripheralModel>>,
    hold_reads: Arc<watch::Sender<bool>>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeripheral {
    /// A powered, advertising board with its LED off
    pub fn new() -> Self {
        let (hold_reads, _) = watch::channel(false);
        Self {
            model: Arc::new(Mutex::new(PeripheralModel::default())),
            hold_reads: Arc::new(hold_reads),
        }
    }

    /// Set the LED as if someone flipped it on the board itself
    pub fn with_led(self, on: bool) -> Self {
        self.lock()
            .values
            .insert(LED_CHAR_UUID, protocol::encode_led(on).to_vec());
        self
    }

    pub fn set_adapter_present(&self, present: bool) {
        self.lock().adapter_present = present;
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.lock().advertising = advertising;
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: Operation) {
        self.lock().fail_next.insert(op);
    }

    /// Keep reads pending until [`release_reads`](Self::release_reads)
    pub fn hold_reads(&self) {
        self.hold_reads.send_replace(true);
    }

    pub fn release_reads(&self) {
        self.hold_reads.send_replace(false);
    }

    pub fn calls(&self) -> Vec<Operation> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: Operation) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// LED state of the board's hardware
    pub fn led_on(&self) -> bool {
        self.lock()
            .values
            .get(&LED_CHAR_UUID)
            .and_then(|v| protocol::decode_led(v))
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Move a finger on the slider; notifies if subscribed
    pub fn touch(&self, position: u16) {
        let mut model = self.lock();
        let value = position.to_le_bytes().to_vec();
        model.values.insert(CAPSENSE_CHAR_UUID, value.clone());
        if let Some(generation) = model.link {
            if model.subscribed.contains(&CAPSENSE_CHAR_UUID) {
                model.emit(TransportEvent::ValueChanged {
                    generation,
                    uuid: CAPSENSE_CHAR_UUID,
                    value,
                });
            }
        }
    }

    /// Peripheral drops the link (board unplugged)
    pub fn drop_link(&self) {
        let mut model = self.lock();
        if let Some(generation) = model.link.take() {
            info!("Simulated peripheral dropped the link");
            model.subscribed.clear();
            model.emit(TransportEvent::LinkLost { generation });
        }
    }

    fn lock(&self) -> MutexGuard<'_, PeripheralModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [`GattTransport`] backed by a [`SimulatedPeripheral`]
pub struct SimulatedTransport {
    peripheral: SimulatedPeripheral,
    config: TransportConfig,
}

impl SimulatedTransport {
    pub fn new(
        peripheral: SimulatedPeripheral,
        config: TransportConfig,
        event_sender: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        peripheral.lock().events = Some(event_sender);
        Self { peripheral, config }
    }

    fn connected(&self, op: Operation) -> Result<(), TransportError> {
        let mut model = self.peripheral.lock();
        let failed = model.record(op);
        if model.link.is_none() {
            return Err(TransportError::NotConnected);
        }
        if failed {
            return Err(match op {
                Operation::DiscoverServices => TransportError::Discovery("injected failure".into()),
                Operation::Read => TransportError::Read("injected failure".into()),
                Operation::Write => TransportError::Write("injected failure".into()),
                _ => TransportError::Subscribe("injected failure".into()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GattTransport for SimulatedTransport {
    async fn start_adapter(&self) -> Result<(), TransportError> {
        let mut model = self.peripheral.lock();
        let failed = model.record(Operation::StartAdapter);
        if failed || !model.adapter_present {
            return Err(TransportError::AdapterUnavailable(
                "simulated radio is off".into(),
            ));
        }
        Ok(())
    }

    async fn scan(&self, service: Uuid) -> Result<DiscoveredDevice, TransportError> {
        let mut model = self.peripheral.lock();
        let failed = model.record(Operation::Scan);
        if !model.adapter_present {
            return Err(TransportError::AdapterUnavailable(
                "simulated radio is off".into(),
            ));
        }
        if failed || !model.advertising || service != self.config.service.service {
            debug!("Simulated scan found nothing");
            return Err(TransportError::NotFound);
        }
        Ok(DiscoveredDevice {
            id: DEVICE_ID.to_string(),
            address: DEVICE_ADDRESS.to_string(),
            name: Some("CapSense LED".to_string()),
            rssi: Some(-48),
        })
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let mut model = self.peripheral.lock();
        let failed = model.record(Operation::Connect);
        if failed || handle.id() != DEVICE_ID {
            return Err(TransportError::ConnectFailed(format!(
                "{} did not answer",
                handle.address()
            )));
        }
        if model.link.is_some() {
            debug!("Reusing simulated link");
        }
        model.link = Some(handle.generation());
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<CharacteristicDescriptor>, TransportError> {
        self.connected(Operation::DiscoverServices)
            .map_err(|e| match e {
                TransportError::NotConnected => TransportError::Discovery(e.to_string()),
                other => other,
            })?;
        Ok(self.peripheral.lock().characteristics.clone())
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>, TransportError> {
        self.connected(Operation::Read)?;

        let mut held = self.peripheral.hold_reads.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let model = self.peripheral.lock();
        if model.link.is_none() {
            return Err(TransportError::NotConnected);
        }
        model
            .values
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError> {
        self.connected(Operation::Write)?;
        let mut model = self.peripheral.lock();
        match model.values.get_mut(&uuid) {
            Some(stored) => {
                *stored = value.to_vec();
                Ok(())
            }
            None => Err(TransportError::CharacteristicNotFound(uuid)),
        }
    }

    async fn subscribe(&self, uuid: Uuid) -> Result<(), TransportError> {
        self.connected(Operation::Subscribe)?;
        self.peripheral.lock().subscribed.insert(uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut model = self.peripheral.lock();
        model.record(Operation::Disconnect);
        model.link = None;
        model.subscribed.clear();
        Ok(())
    }

    async fn close(&self) {
        let mut model = self.peripheral.lock();
        model.record(Operation::Close);
        model.link = None;
        model.subscribed.clear();
    }
}
