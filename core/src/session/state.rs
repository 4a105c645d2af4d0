//! Session state, errors and outward events

use crate::codec::CodecError;
use crate::radio::RadioError;
use crate::registry::Capability;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of the single peripheral session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting { peripheral_id: String },
    Connected { peripheral_id: String },
    Disconnecting,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl SessionState {
    /// Peripheral being connected or connected; `None` in every other state
    pub fn peripheral_id(&self) -> Option<&str> {
        match self {
            SessionState::Connecting { peripheral_id } | SessionState::Connected { peripheral_id } => {
                Some(peripheral_id)
            }
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Scanning => write!(f, "Scanning"),
            SessionState::Connecting { peripheral_id } => write!(f, "Connecting({})", peripheral_id),
            SessionState::Connected { peripheral_id } => write!(f, "Connected({})", peripheral_id),
            SessionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Bluetooth is off")]
    RadioOff,
    #[error("Another connection attempt is in progress")]
    ConnectionInProgress,
    #[error("Connect failed: {0}")]
    ConnectFailed(RadioError),
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(RadioError),
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("No {capability} characteristic at index {index}")]
    NoCapability { capability: Capability, index: usize },
    #[error("Write failed: {0}")]
    WriteFailed(RadioError),
    #[error("Read failed: {0}")]
    ReadFailed(RadioError),
    #[error("Notification request failed: {0}")]
    NotificationFailed(RadioError),
    #[error("Scan failed: {0}")]
    ScanFailed(RadioError),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(RadioError),
    #[error("No peripheral connected")]
    NotConnected,
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),
    #[error("Invalid payload: {0}")]
    Payload(#[from] CodecError),
    #[error("Radio error: {0}")]
    Radio(RadioError),
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged(SessionState),
    RadioPowerChanged(bool),
    /// The visible device list changed
    CatalogChanged,
    /// Upper-case hex payload appended to the receive buffer
    DataReceived(String),
}

/// Application-level parser fed with every accepted inbound payload
pub trait PayloadSink: Send + Sync {
    fn on_payload(&self, peripheral_id: &str, hex_payload: &str);
}

impl<F> PayloadSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn on_payload(&self, peripheral_id: &str, hex_payload: &str) {
        self(peripheral_id, hex_payload)
    }
}

/// Sink that drops payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PayloadSink for NullSink {
    fn on_payload(&self, _peripheral_id: &str, _hex_payload: &str) {}
}
