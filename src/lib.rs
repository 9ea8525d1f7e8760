//! BLE central session for a CapSense/LED peripheral.
//!
//! The [`SessionStateMachine`](domain::session::SessionStateMachine) owns the
//! connection lifecycle and the characteristic cache; front ends drive it
//! through a [`SessionHandle`](domain::session::SessionHandle) and observe it
//! through the event bus.

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use domain::models::{
    CharacteristicName, CharacteristicValue, CommandKind, DisconnectReason, Intent,
    PeripheralHandle, SessionEvent, SessionState,
};
pub use domain::session::{SessionHandle, SessionStateMachine};
pub use error::{SessionError, TransportError};
