//! Radio boundary
//!
//! [`RadioBridge`] is the request side of the platform BLE driver; the
//! driver publishes asynchronous events into a [`RadioEventHub`], one
//! broadcast stream per event category. The session subscribes for its
//! lifetime and drops the subscription on teardown.

use crate::catalog::PeripheralRecord;
use crate::registry::ServiceListing;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("Bluetooth adapter unavailable")]
    Unavailable,
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),
    #[error("Operation not supported on this platform: {0}")]
    Unsupported(&'static str),
    #[error("Operation timed out")]
    Timeout,
    #[error("Peripheral disconnected: {0}")]
    Disconnected(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Adapter power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
}

/// Link-level connection change reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected { peripheral_id: String, status: i32 },
    Disconnected { peripheral_id: String, status: i32 },
}

/// Characteristic value pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueUpdate {
    pub peripheral_id: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    /// Hex payload; case depends on platform
    pub value: String,
}

/// Any radio event, for hosts that pump events by hand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioEvent {
    Power(PowerState),
    /// End of the scan started with this id, by expiry or stop request
    ScanStopped(u64),
    Discovered(PeripheralRecord),
    Connection(ConnectionEvent),
    Value(ValueUpdate),
}

// ============================================================================
// PLATFORM BRIDGE TRAIT
// ============================================================================

/// Platform BLE driver requests.
///
/// Every call completes exactly once. Calls are non-blocking from the
/// session's point of view; results for a peripheral that is no longer
/// current are discarded by the session, not by the bridge.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RadioBridge: Send + Sync {
    /// Ask the driver to re-emit the current power state
    async fn check_state(&self) -> Result<(), RadioError>;

    /// Ask the user to turn Bluetooth on
    async fn enable(&self) -> Result<(), RadioError>;

    /// Start scan `scan_id`; the driver emits a scan-stopped event tagged
    /// with that id when it ends
    async fn start_scan(
        &self,
        scan_id: u64,
        service_filters: &[String],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<(), RadioError>;

    /// Stop the running scan, reporting it with the id it was started with
    async fn stop_scan(&self) -> Result<(), RadioError>;

    async fn connect(&self, peripheral_id: &str) -> Result<(), RadioError>;

    async fn retrieve_services(&self, peripheral_id: &str) -> Result<ServiceListing, RadioError>;

    /// Drop the link; a successful request is reported by exactly one
    /// disconnected event for the peripheral
    async fn disconnect(&self, peripheral_id: &str) -> Result<(), RadioError>;

    async fn write(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError>;

    async fn write_without_response(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError>;

    async fn read(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<Vec<u8>, RadioError>;

    async fn start_notification(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(), RadioError>;

    async fn stop_notification(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(), RadioError>;

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16, RadioError>;

    async fn is_connected(&self, peripheral_id: &str) -> Result<bool, RadioError>;

    async fn connected_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError>;

    async fn discovered_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError>;

    async fn bonded_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError>;

    async fn create_bond(&self, peripheral_id: &str) -> Result<(), RadioError>;

    /// Drop a disconnected peripheral from the driver's cache
    async fn remove_peripheral(&self, peripheral_id: &str) -> Result<(), RadioError>;
}

// ============================================================================
// EVENT HUB
// ============================================================================

/// Typed event streams the driver publishes into
#[derive(Debug, Clone)]
pub struct RadioEventHub {
    power: broadcast::Sender<PowerState>,
    scan_stopped: broadcast::Sender<u64>,
    discovered: broadcast::Sender<PeripheralRecord>,
    connection: broadcast::Sender<ConnectionEvent>,
    value: broadcast::Sender<ValueUpdate>,
}

impl RadioEventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            power: broadcast::channel(capacity).0,
            scan_stopped: broadcast::channel(capacity).0,
            discovered: broadcast::channel(capacity).0,
            connection: broadcast::channel(capacity).0,
            value: broadcast::channel(capacity).0,
        }
    }

    /// Publish an event on its category stream. Events with no subscriber are dropped.
    pub fn publish(&self, event: RadioEvent) {
        let delivered = match event {
            RadioEvent::Power(state) => self.power.send(state).is_ok(),
            RadioEvent::ScanStopped(scan_id) => self.scan_stopped.send(scan_id).is_ok(),
            RadioEvent::Discovered(record) => self.discovered.send(record).is_ok(),
            RadioEvent::Connection(event) => self.connection.send(event).is_ok(),
            RadioEvent::Value(update) => self.value.send(update).is_ok(),
        };
        if !delivered {
            tracing::trace!("Radio event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> RadioSubscription {
        RadioSubscription {
            power: self.power.subscribe(),
            scan_stopped: self.scan_stopped.subscribe(),
            discovered: self.discovered.subscribe(),
            connection: self.connection.subscribe(),
            value: self.value.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.power.receiver_count()
    }
}

impl Default for RadioEventHub {
    fn default() -> Self {
        Self::new(64)
    }
}

/// One receiver per stream; dropping it unsubscribes from all of them
#[derive(Debug)]
pub struct RadioSubscription {
    pub power: broadcast::Receiver<PowerState>,
    pub scan_stopped: broadcast::Receiver<u64>,
    pub discovered: broadcast::Receiver<PeripheralRecord>,
    pub connection: broadcast::Receiver<ConnectionEvent>,
    pub value: broadcast::Receiver<ValueUpdate>,
}
