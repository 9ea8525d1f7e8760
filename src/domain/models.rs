use crate::error::UnknownCharacteristic;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Characteristics of the CapSense/LED service, by symbolic name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicName {
    Led,
    CapSense,
}

impl CharacteristicName {
    pub const ALL: [CharacteristicName; 2] = [Self::Led, Self::CapSense];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Led => "Led",
            Self::CapSense => "CapSense",
        }
    }
}

impl fmt::Display for CharacteristicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CharacteristicName {
    type Err = UnknownCharacteristic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "led" => Ok(Self::Led),
            "capsense" => Ok(Self::CapSense),
            _ => Err(UnknownCharacteristic(s.to_string())),
        }
    }
}

/// A device matched by a scan, as reported by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Transport-specific key used to find the device again on connect
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// The single bound peripheral.
///
/// Carries the session generation it was created under; transport callbacks
/// tagged with an older generation belong to an abandoned session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    device: DiscoveredDevice,
    generation: u64,
}

impl PeripheralHandle {
    pub fn new(device: DiscoveredDevice, generation: u64) -> Self {
        Self { device, generation }
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn id(&self) -> &str {
        &self.device.id
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    pub fn name(&self) -> Option<&str> {
        self.device.name.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.address()),
            None => f.write_str(self.address()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// A characteristic reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Last confirmed bytes of a characteristic.
///
/// `revision` increases with every registry update and never goes back,
/// not even across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicValue {
    pub uuid: Uuid,
    pub bytes: Vec<u8>,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
}

impl SessionState {
    /// Whether `kind` may be issued in this state.
    ///
    /// `Connect` from `Scanning` additionally needs a bound handle, which
    /// only the state machine knows.
    pub fn accepts(&self, kind: CommandKind) -> bool {
        use SessionState::*;
        match kind {
            CommandKind::StartAdapter | CommandKind::Scan => *self == Idle,
            CommandKind::Connect => {
                matches!(self, Scanning | Connected | DiscoveringServices | Ready)
            }
            CommandKind::DiscoverServices => *self == Connected,
            CommandKind::Disconnect => true,
            CommandKind::ReadCharacteristic
            | CommandKind::WriteCharacteristic
            | CommandKind::EnableNotifications => *self == Ready,
        }
    }

    /// The edges of the session lifecycle. Every transition must be one of these.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Scanning)
                | (Scanning, Connecting)
                | (Connecting, Connected)
                | (Connected, DiscoveringServices)
                | (DiscoveringServices, Ready)
                | (Scanning, Disconnecting)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (DiscoveringServices, Disconnecting)
                | (Ready, Disconnecting)
                | (Disconnecting, Idle)
        )
    }

    /// A link to the peripheral may exist in this state
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::DiscoveringServices | Self::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Payload-free discriminant of [`Intent`], used for guards and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartAdapter,
    Scan,
    Connect,
    DiscoverServices,
    Disconnect,
    ReadCharacteristic,
    WriteCharacteristic,
    EnableNotifications,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Commands a front end issues against the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    StartAdapter,
    Scan,
    Connect,
    DiscoverServices,
    Disconnect,
    ReadCharacteristic(CharacteristicName),
    WriteCharacteristic(CharacteristicName, Vec<u8>),
    EnableNotifications(CharacteristicName),
}

impl Intent {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::StartAdapter => CommandKind::StartAdapter,
            Self::Scan => CommandKind::Scan,
            Self::Connect => CommandKind::Connect,
            Self::DiscoverServices => CommandKind::DiscoverServices,
            Self::Disconnect => CommandKind::Disconnect,
            Self::ReadCharacteristic(_) => CommandKind::ReadCharacteristic,
            Self::WriteCharacteristic(..) => CommandKind::WriteCharacteristic,
            Self::EnableNotifications(_) => CommandKind::EnableNotifications,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The user asked for it
    Requested,
    /// The peripheral dropped the link
    LinkLost,
    /// A transport operation failed and the session was torn down
    Failed,
}

/// Events published to observers of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    DeviceFound(PeripheralHandle),
    Connected(PeripheralHandle),
    Disconnected { reason: DisconnectReason },
    ServicesDiscovered(BTreeSet<CharacteristicName>),
    CharacteristicUpdated {
        name: CharacteristicName,
        value: CharacteristicValue,
    },
}
