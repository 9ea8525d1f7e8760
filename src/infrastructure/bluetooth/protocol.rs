//! CapSense/LED Protocol
//!
//! Wire-level identifiers and payload formats of the custom GATT service
//! exposed by the peripheral.

use crate::domain::models::CharacteristicName;
use uuid::Uuid;

/// CapSense/LED service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00009D67_0000_1000_8000_00805F9B34FB);

/// LED characteristic UUID - single byte, 0x00 = off, anything else = on
pub const LED_CHAR_UUID: Uuid = Uuid::from_u128(0x00004BE6_0000_1000_8000_00805F9B34FB);

/// CapSense characteristic UUID - slider position, notifiable
pub const CAPSENSE_CHAR_UUID: Uuid = Uuid::from_u128(0x00002B67_0000_1000_8000_00805F9B34FB);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805F9B34FB);

/// CapSense reading reported while nothing touches the slider
pub const CAPSENSE_NO_TOUCH: u16 = 0xFFFF;

/// The target service and the characteristics of interest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub service: Uuid,
    pub characteristics: &'static [(CharacteristicName, Uuid)],
}

/// The compiled-in CapSense/LED service
pub const CAPSENSE_LED_SERVICE: ServiceDescriptor = ServiceDescriptor {
    service: SERVICE_UUID,
    characteristics: &[
        (CharacteristicName::Led, LED_CHAR_UUID),
        (CharacteristicName::CapSense, CAPSENSE_CHAR_UUID),
    ],
};

impl ServiceDescriptor {
    pub fn uuid_of(&self, name: CharacteristicName) -> Option<Uuid> {
        self.characteristics
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, uuid)| *uuid)
    }

    pub fn name_of(&self, uuid: Uuid) -> Option<CharacteristicName> {
        self.characteristics
            .iter()
            .find(|(_, u)| *u == uuid)
            .map(|(name, _)| *name)
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        CAPSENSE_LED_SERVICE
    }
}

/// LED payload for the requested state
pub fn encode_led(on: bool) -> [u8; 1] {
    [u8::from(on)]
}

/// LED state from a characteristic value; any nonzero first byte means on
pub fn decode_led(bytes: &[u8]) -> Option<bool> {
    bytes.first().map(|b| *b != 0x00)
}

/// Slider position from a CapSense value.
///
/// # Payload (2 bytes)
///
/// ```text
/// [0-1] : position (u16 little-endian), 0xFFFF = no touch
/// ```
///
/// Returns `None` for short payloads and for the no-touch marker.
pub fn decode_capsense(bytes: &[u8]) -> Option<u16> {
    let raw = match bytes {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => return None,
    };
    (raw != CAPSENSE_NO_TOUCH).then_some(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string().to_uppercase(),
            "00009D67-0000-1000-8000-00805F9B34FB"
        );
        assert_eq!(
            LED_CHAR_UUID.to_string().to_uppercase(),
            "00004BE6-0000-1000-8000-00805F9B34FB"
        );
        assert_eq!(
            CAPSENSE_CHAR_UUID.to_string().to_uppercase(),
            "00002B67-0000-1000-8000-00805F9B34FB"
        );
    }

    #[test]
    fn test_led_payload() {
        assert_eq!(encode_led(true), [0x01]);
        assert_eq!(encode_led(false), [0x00]);
        assert_eq!(decode_led(&[0x00]), Some(false));
        assert_eq!(decode_led(&[0x7F]), Some(true));
        assert_eq!(decode_led(&[]), None);
    }

    #[test]
    fn test_capsense_payload() {
        assert_eq!(decode_capsense(&[0x34, 0x00]), Some(0x34));
        assert_eq!(decode_capsense(&[0xFF, 0xFF]), None);
        assert_eq!(decode_capsense(&[0x01]), None);
    }

    #[test]
    fn test_descriptor_lookup() {
        let d = CAPSENSE_LED_SERVICE;
        assert_eq!(d.uuid_of(CharacteristicName::Led), Some(LED_CHAR_UUID));
        assert_eq!(
            d.name_of(CAPSENSE_CHAR_UUID),
            Some(CharacteristicName::CapSense)
        );
        assert_eq!(d.name_of(CCCD_UUID), None);
    }
}
