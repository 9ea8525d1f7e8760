//! Error types for the radio transport and the session state machine.

use crate::domain::models::{CommandKind, SessionState};
use thiserror::Error;

/// Failures reported by a [`GattTransport`](crate::infrastructure::bluetooth::GattTransport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("BLE adapter not available: {0}")]
    AdapterUnavailable(String),

    #[error("No peripheral advertising the service was found")]
    NotFound,

    #[error("Failed to connect to peripheral: {0}")]
    ConnectFailed(String),

    #[error("Failed to discover services: {0}")]
    Discovery(String),

    #[error("Failed to read characteristic: {0}")]
    Read(String),

    #[error("Failed to write characteristic: {0}")]
    Write(String),

    #[error("Failed to subscribe to notifications: {0}")]
    Subscribe(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("Peripheral not connected")]
    NotConnected,
}

/// Errors surfaced to whoever issued a session command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{command} is not allowed while {state}")]
    InvalidState {
        command: CommandKind,
        state: SessionState,
    },

    /// The session was torn down before the operation completed
    #[error("Operation abandoned by a session teardown")]
    Abandoned,

    #[error("Session is closed")]
    SessionClosed,
}

impl SessionError {
    /// Radio missing or disabled; retrying will not help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::AdapterUnavailable(_)) | Self::SessionClosed
        )
    }

    /// Transient failure the user may retry with the same command
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(TransportError::AdapterUnavailable(_)) => false,
            Self::Transport(_) | Self::Abandoned => true,
            Self::InvalidState { .. } | Self::SessionClosed => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown characteristic: {0}")]
pub struct UnknownCharacteristic(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        let adapter = SessionError::from(TransportError::AdapterUnavailable("off".into()));
        assert!(adapter.is_fatal());
        assert!(!adapter.is_recoverable());

        let read = SessionError::from(TransportError::Read("timeout".into()));
        assert!(read.is_recoverable());
        assert!(!read.is_fatal());

        let invalid = SessionError::InvalidState {
            command: CommandKind::DiscoverServices,
            state: SessionState::Idle,
        };
        assert!(!invalid.is_recoverable());
        assert_eq!(
            invalid.to_string(),
            "DiscoverServices is not allowed while Idle"
        );
    }
}
