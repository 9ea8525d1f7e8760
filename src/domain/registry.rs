//! Cache of the last confirmed value of each characteristic of interest.

use crate::domain::models::{CharacteristicName, CharacteristicValue};
use crate::infrastructure::bluetooth::protocol::{self, ServiceDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Result of looking up a cached value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedValue {
    Fresh(CharacteristicValue),
    /// Nothing read or notified since the last Ready transition
    Stale,
}

impl CachedValue {
    pub fn fresh(&self) -> Option<&CharacteristicValue> {
        match self {
            Self::Fresh(value) => Some(value),
            Self::Stale => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale)
    }
}

/// UUID -> value map with lookup by symbolic name.
///
/// Only the session state machine mutates it, after a confirmed read, write
/// or notification.
#[derive(Debug)]
pub struct CharacteristicRegistry {
    descriptor: ServiceDescriptor,
    values: HashMap<Uuid, CharacteristicValue>,
    revision: u64,
}

impl CharacteristicRegistry {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            values: HashMap::new(),
            revision: 0,
        }
    }

    pub fn uuid_of(&self, name: CharacteristicName) -> Option<Uuid> {
        self.descriptor.uuid_of(name)
    }

    pub fn name_of(&self, uuid: Uuid) -> Option<CharacteristicName> {
        self.descriptor.name_of(uuid)
    }

    pub fn get(&self, name: CharacteristicName) -> CachedValue {
        self.uuid_of(name)
            .and_then(|uuid| self.values.get(&uuid))
            .map(|value| CachedValue::Fresh(value.clone()))
            .unwrap_or(CachedValue::Stale)
    }

    /// Cached LED state, if known
    pub fn led_state(&self) -> Option<bool> {
        self.get(CharacteristicName::Led)
            .fresh()
            .and_then(|v| protocol::decode_led(&v.bytes))
    }

    /// Cached slider position, if known and touched
    pub fn capsense(&self) -> Option<u16> {
        self.get(CharacteristicName::CapSense)
            .fresh()
            .and_then(|v| protocol::decode_capsense(&v.bytes))
    }

    /// Store confirmed bytes. Returns `None` for characteristics outside the service.
    pub(crate) fn set(&mut self, uuid: Uuid, bytes: Vec<u8>) -> Option<CharacteristicValue> {
        self.name_of(uuid)?;
        self.revision += 1;
        let value = CharacteristicValue {
            uuid,
            bytes,
            revision: self.revision,
        };
        self.values.insert(uuid, value.clone());
        Some(value)
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }
}

/// Read-only, shareable view of the registry for observers
#[derive(Debug, Clone)]
pub struct RegistryView {
    inner: Arc<RwLock<CharacteristicRegistry>>,
}

impl RegistryView {
    pub(crate) fn new(inner: Arc<RwLock<CharacteristicRegistry>>) -> Self {
        Self { inner }
    }

    pub fn get(&self, name: CharacteristicName) -> CachedValue {
        self.read(|r| r.get(name))
    }

    pub fn led_state(&self) -> Option<bool> {
        self.read(CharacteristicRegistry::led_state)
    }

    pub fn capsense(&self) -> Option<u16> {
        self.read(CharacteristicRegistry::capsense)
    }

    fn read<T>(&self, f: impl FnOnce(&CharacteristicRegistry) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{
        CAPSENSE_CHAR_UUID, CAPSENSE_LED_SERVICE, CCCD_UUID, LED_CHAR_UUID,
    };

    #[test]
    fn test_stale_until_set() {
        let mut registry = CharacteristicRegistry::new(CAPSENSE_LED_SERVICE);
        assert!(registry.get(CharacteristicName::Led).is_stale());
        assert_eq!(registry.led_state(), None);

        registry.set(LED_CHAR_UUID, vec![0x01]);
        assert_eq!(registry.led_state(), Some(true));
        assert!(registry.get(CharacteristicName::CapSense).is_stale());
    }

    #[test]
    fn test_revisions_survive_clear() {
        let mut registry = CharacteristicRegistry::new(CAPSENSE_LED_SERVICE);
        let first = registry.set(LED_CHAR_UUID, vec![0x00]).unwrap();
        registry.clear();
        assert!(registry.get(CharacteristicName::Led).is_stale());

        let second = registry.set(CAPSENSE_CHAR_UUID, vec![0x10, 0x00]).unwrap();
        assert!(second.revision > first.revision);
        assert_eq!(registry.capsense(), Some(0x10));
    }

    #[test]
    fn test_unknown_uuid_ignored() {
        let mut registry = CharacteristicRegistry::new(CAPSENSE_LED_SERVICE);
        assert!(registry.set(CCCD_UUID, vec![0x01, 0x00]).is_none());
    }

    #[test]
    fn test_view_reads_through() {
        let shared = Arc::new(RwLock::new(CharacteristicRegistry::new(
            CAPSENSE_LED_SERVICE,
        )));
        let view = RegistryView::new(shared.clone());
        assert_eq!(view.led_state(), None);

        shared.write().unwrap().set(LED_CHAR_UUID, vec![0x00]);
        assert_eq!(view.led_state(), Some(false));
    }
}
