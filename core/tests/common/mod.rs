// Scripted in-memory radio shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use gattlink_core::{
    BleSession, ConnectionEvent, PeripheralRecord, PropertyFlags, RadioBridge, RadioError,
    RadioEvent, RadioEventHub, RawCharacteristic, ServiceListing, SessionSettings, ValueUpdate,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// One recorded write request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub peripheral_id: String,
    pub characteristic_uuid: String,
    pub payload: Vec<u8>,
    pub with_response: bool,
}

/// Radio double that answers from a fixed peripheral table.
///
/// A gated connect or write parks until the test notifies the gate, which
/// lets a test interleave radio events with an in-flight request.
pub struct ScriptedRadio {
    hub: RadioEventHub,
    peripherals: Mutex<HashMap<String, ServiceListing>>,
    calls: Mutex<Vec<String>>,
    writes: Mutex<Vec<WriteRecord>>,
    read_value: Mutex<Vec<u8>>,
    /// Id of the most recently started scan
    last_scan: Mutex<u64>,
    connect_gate: Mutex<Option<Arc<Notify>>>,
    write_gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hub: RadioEventHub::new(32),
            peripherals: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            read_value: Mutex::new(Vec::new()),
            last_scan: Mutex::new(0),
            connect_gate: Mutex::new(None),
            write_gate: Mutex::new(None),
        })
    }

    pub fn hub(&self) -> &RadioEventHub {
        &self.hub
    }

    pub fn emit(&self, event: RadioEvent) {
        self.hub.publish(event);
    }

    /// Register a peripheral with a read/notify characteristic and a
    /// write characteristic on service FFF0.
    pub fn add_peripheral(&self, id: &str, name: &str) {
        let listing = ServiceListing {
            id: id.to_string(),
            name: Some(name.to_string()),
            characteristics: vec![
                raw("fff1", &["Read", "Notify"]),
                raw("fff2", &["Write", "WriteWithoutResponse"]),
            ],
        };
        self.peripherals.lock().insert(id.to_string(), listing);
    }

    /// End the running scan as if its window had closed
    pub fn expire_scan(&self) {
        let scan_id = *self.last_scan.lock();
        self.emit(RadioEvent::ScanStopped(scan_id));
    }

    pub fn set_read_value(&self, value: &[u8]) {
        *self.read_value.lock() = value.to_vec();
    }

    pub fn gate_connect(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.connect_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn gate_write(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.write_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    fn record(&self, name: &str) {
        self.calls.lock().push(name.to_string());
    }

    fn known(&self, id: &str) -> Result<(), RadioError> {
        if self.peripherals.lock().contains_key(id) {
            Ok(())
        } else {
            Err(RadioError::PeripheralNotFound(id.to_string()))
        }
    }

    /// Gates are one-shot: the first request through consumes it
    async fn wait_gate(gate: &Mutex<Option<Arc<Notify>>>) {
        let gate = gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    async fn transmit(
        &self,
        peripheral_id: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
        with_response: bool,
    ) -> Result<(), RadioError> {
        self.known(peripheral_id)?;
        Self::wait_gate(&self.write_gate).await;
        self.writes.lock().push(WriteRecord {
            peripheral_id: peripheral_id.to_string(),
            characteristic_uuid: characteristic_uuid.to_string(),
            payload,
            with_response,
        });
        Ok(())
    }
}

fn raw(characteristic: &str, properties: &[&str]) -> RawCharacteristic {
    RawCharacteristic {
        service: "fff0".to_string(),
        characteristic: characteristic.to_string(),
        properties: PropertyFlags::Listed(properties.iter().map(|p| p.to_string()).collect()),
    }
}

#[async_trait]
impl RadioBridge for ScriptedRadio {
    async fn check_state(&self) -> Result<(), RadioError> {
        self.record("check_state");
        Ok(())
    }

    async fn enable(&self) -> Result<(), RadioError> {
        self.record("enable");
        Ok(())
    }

    async fn start_scan(
        &self,
        scan_id: u64,
        _service_filters: &[String],
        _duration_secs: u64,
        _allow_duplicates: bool,
    ) -> Result<(), RadioError> {
        self.record("start_scan");
        *self.last_scan.lock() = scan_id;
        Ok(())
    }

    /// Like most platforms, stopping reports a stop even when the scan
    /// already ended on its own
    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.record("stop_scan");
        let scan_id = *self.last_scan.lock();
        self.emit(RadioEvent::ScanStopped(scan_id));
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), RadioError> {
        self.record("connect");
        Self::wait_gate(&self.connect_gate).await;
        self.known(peripheral_id)?;
        self.emit(RadioEvent::Connection(ConnectionEvent::Connected {
            peripheral_id: peripheral_id.to_string(),
            status: 0,
        }));
        Ok(())
    }

    async fn retrieve_services(&self, peripheral_id: &str) -> Result<ServiceListing, RadioError> {
        self.record("retrieve_services");
        self.peripherals
            .lock()
            .get(peripheral_id)
            .cloned()
            .ok_or_else(|| RadioError::PeripheralNotFound(peripheral_id.to_string()))
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), RadioError> {
        self.record("disconnect");
        self.emit(RadioEvent::Connection(ConnectionEvent::Disconnected {
            peripheral_id: peripheral_id.to_string(),
            status: 0,
        }));
        Ok(())
    }

    async fn write(
        &self,
        peripheral_id: &str,
        _service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.record("write");
        self.transmit(peripheral_id, characteristic_uuid, payload, true).await
    }

    async fn write_without_response(
        &self,
        peripheral_id: &str,
        _service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        self.record("write_without_response");
        self.transmit(peripheral_id, characteristic_uuid, payload, false).await
    }

    async fn read(
        &self,
        peripheral_id: &str,
        _service_uuid: &str,
        _characteristic_uuid: &str,
    ) -> Result<Vec<u8>, RadioError> {
        self.record("read");
        self.known(peripheral_id)?;
        Ok(self.read_value.lock().clone())
    }

    async fn start_notification(
        &self,
        peripheral_id: &str,
        _service_uuid: &str,
        _characteristic_uuid: &str,
    ) -> Result<(), RadioError> {
        self.record("start_notification");
        self.known(peripheral_id)
    }

    async fn stop_notification(
        &self,
        peripheral_id: &str,
        _service_uuid: &str,
        _characteristic_uuid: &str,
    ) -> Result<(), RadioError> {
        self.record("stop_notification");
        self.known(peripheral_id)
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16, RadioError> {
        self.known(peripheral_id)?;
        Ok(-60)
    }

    async fn is_connected(&self, peripheral_id: &str) -> Result<bool, RadioError> {
        self.known(peripheral_id)?;
        Ok(false)
    }

    async fn connected_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        Ok(Vec::new())
    }

    async fn discovered_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        Ok(self
            .peripherals
            .lock()
            .values()
            .map(|l| PeripheralRecord::new(l.id.clone(), l.name.clone()))
            .collect())
    }

    async fn bonded_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        Ok(Vec::new())
    }

    async fn create_bond(&self, _peripheral_id: &str) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("bonding"))
    }

    async fn remove_peripheral(&self, peripheral_id: &str) -> Result<(), RadioError> {
        self.record("remove_peripheral");
        self.known(peripheral_id)
    }
}

pub fn quiet_settings() -> SessionSettings {
    SessionSettings {
        auto_scan_on_power_on: false,
        ..Default::default()
    }
}

pub fn session_with(radio: &Arc<ScriptedRadio>, settings: SessionSettings) -> Arc<BleSession> {
    let bridge: Arc<dyn RadioBridge> = Arc::clone(radio) as Arc<dyn RadioBridge>;
    Arc::new(BleSession::new(settings, bridge).unwrap())
}

pub fn discovered(id: &str, name: &str) -> RadioEvent {
    RadioEvent::Discovered(PeripheralRecord::new(id, Some(name.to_string())))
}

pub fn value(id: &str, hex: &str) -> RadioEvent {
    RadioEvent::Value(ValueUpdate {
        peripheral_id: id.to_string(),
        service_uuid: "fff0".to_string(),
        characteristic_uuid: "fff1".to_string(),
        value: hex.to_string(),
    })
}

/// Poll `condition` until it holds or a second passes
pub async fn wait_until(session: &BleSession, condition: impl Fn(&BleSession) -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        while !condition(session) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached; state is {}", session.state());
}
