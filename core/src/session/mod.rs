//! Single-peripheral BLE session
//!
//! [`BleSession`] owns the session state, the device catalog and the
//! capability registry for the current connection. Requests go out through
//! a [`RadioBridge`]; asynchronous radio events come back through
//! [`BleSession::handle_event`] (or an attached event loop).
//!
//! State lives behind one `parking_lot::Mutex` that is never held across an
//! `.await`. Every radio result is re-checked against the state it was
//! issued for: connect results against the attempt counter, link-scoped
//! results (write, read, notify, disconnect) against the link epoch, so a
//! result for a peripheral that is no longer current changes nothing.
//! Radio events are filtered the same way: scan-stopped events must carry
//! the current scan id, and disconnected events the session caused itself
//! are counted off per peripheral before any cleanup runs.

mod event_loop;
mod state;

pub use event_loop::EventLoopHandle;
pub use state::{NullSink, PayloadSink, SessionError, SessionEvent, SessionState};

use crate::catalog::{DeviceCatalog, PeripheralRecord};
use crate::codec::{bytes_to_text, frame, hex_to_bytes, text_to_bytes};
use crate::radio::{ConnectionEvent, PowerState, RadioBridge, RadioError, RadioEvent, ValueUpdate};
use crate::registry::{
    Capability, CapabilityIndex, CharacteristicRef, CharacteristicRegistry, ServiceListing,
};
use crate::settings::{SessionSettings, SettingsError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ============================================================================
// SESSION INTERNALS
// ============================================================================

#[derive(Debug, Default)]
struct Inner {
    state: SessionState,
    radio_on: bool,
    catalog: DeviceCatalog,
    registry: CharacteristicRegistry,
    receive_buffer: Vec<String>,
    last_written: Option<String>,
    last_read: Option<String>,
    notifying: Vec<CharacteristicRef>,
    /// Id of the latest scan; stop events for any other id are stale
    scan_id: u64,
    /// Disconnected events still owed for disconnects the session requested
    own_disconnects: HashMap<String, u32>,
    connect_attempt: u64,
    link_epoch: u64,
    /// Peripheral of the current link; survives the Disconnecting state
    link_peripheral: Option<String>,
}

/// A characteristic resolved against the current link
#[derive(Debug, Clone)]
struct LinkTarget {
    peripheral_id: String,
    characteristic: CharacteristicRef,
    epoch: u64,
}

impl Inner {
    fn set_state(&mut self, next: SessionState, events: &mut Vec<SessionEvent>) {
        if self.state == next {
            return;
        }
        debug!("Session state {} -> {}", self.state, next);
        self.state = next.clone();
        events.push(SessionEvent::StateChanged(next));
    }

    fn clear_link_data(&mut self) {
        self.receive_buffer.clear();
        self.last_written = None;
        self.last_read = None;
        self.notifying.clear();
    }

    fn attempt_is_current(&self, attempt: u64, peripheral_id: &str) -> bool {
        self.connect_attempt == attempt
            && matches!(&self.state, SessionState::Connecting { peripheral_id: id } if id == peripheral_id)
    }

    /// End a connect attempt that never produced a link
    fn cancel_connect(&mut self, events: &mut Vec<SessionEvent>) {
        if let SessionState::Connecting { peripheral_id } = self.state.clone() {
            self.connect_attempt += 1;
            self.catalog.set_connecting(&peripheral_id, false);
            self.set_state(SessionState::Idle, events);
            events.push(SessionEvent::CatalogChanged);
        }
    }

    /// Drop everything scoped to the current link and return to Idle
    fn teardown_link(&mut self, events: &mut Vec<SessionEvent>) {
        self.registry.reset();
        self.clear_link_data();
        if let Some(id) = self.link_peripheral.take() {
            self.catalog.set_connecting(&id, false);
        }
        self.link_epoch += 1;
        self.catalog.restore();
        self.set_state(SessionState::Idle, events);
        events.push(SessionEvent::CatalogChanged);
    }

    fn expect_own_disconnect(&mut self, peripheral_id: &str) {
        *self.own_disconnects.entry(peripheral_id.to_string()).or_insert(0) += 1;
    }

    /// Forget one owed event, e.g. when the request failed and none will come
    fn forget_own_disconnect(&mut self, peripheral_id: &str) -> bool {
        match self.own_disconnects.get_mut(peripheral_id) {
            Some(owed) => {
                *owed -= 1;
                if *owed == 0 {
                    self.own_disconnects.remove(peripheral_id);
                }
                true
            }
            None => false,
        }
    }

    fn link_target(&self, capability: Capability, index: usize) -> Result<LinkTarget, SessionError> {
        let peripheral_id = match &self.state {
            SessionState::Connected { peripheral_id } => peripheral_id.clone(),
            _ => return Err(SessionError::NotConnected),
        };
        let characteristic = self
            .registry
            .get(capability, index)
            .cloned()
            .ok_or(SessionError::NoCapability { capability, index })?;

        Ok(LinkTarget {
            peripheral_id,
            characteristic,
            epoch: self.link_epoch,
        })
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// State machine for one BLE central talking to at most one peripheral
pub struct BleSession {
    settings: SessionSettings,
    radio: Arc<dyn RadioBridge>,
    sink: Arc<dyn PayloadSink>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SessionEvent>,
}

impl BleSession {
    pub fn new(settings: SessionSettings, radio: Arc<dyn RadioBridge>) -> Result<Self, SettingsError> {
        Self::with_payload_sink(settings, radio, Arc::new(NullSink))
    }

    /// Create a session whose accepted inbound payloads are also handed to `sink`
    pub fn with_payload_sink(
        settings: SessionSettings,
        radio: Arc<dyn RadioBridge>,
        sink: Arc<dyn PayloadSink>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let (events, _) = broadcast::channel(settings.event_buffer);

        Ok(Self {
            settings,
            radio,
            sink,
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    /// Run `f` under the state lock, then publish the events it queued
    fn update<R>(&self, f: impl FnOnce(&mut Inner, &mut Vec<SessionEvent>) -> R) -> R {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut pending)
        };
        for event in pending {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
        result
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    /// Peripheral being connected or connected
    pub fn peripheral_id(&self) -> Option<String> {
        self.inner.lock().state.peripheral_id().map(str::to_string)
    }

    pub fn radio_on(&self) -> bool {
        self.inner.lock().radio_on
    }

    /// Visible catalog in discovery order
    pub fn devices(&self) -> Vec<PeripheralRecord> {
        self.inner.lock().catalog.snapshot()
    }

    pub fn capabilities(&self) -> CapabilityIndex {
        self.inner.lock().registry.index().clone()
    }

    /// Everything received since the last write, as one hex string
    pub fn received_data(&self) -> String {
        self.inner.lock().receive_buffer.concat()
    }

    pub fn last_written(&self) -> Option<String> {
        self.inner.lock().last_written.clone()
    }

    pub fn last_read(&self) -> Option<String> {
        self.inner.lock().last_read.clone()
    }

    pub fn notifying(&self) -> Vec<CharacteristicRef> {
        self.inner.lock().notifying.clone()
    }

    // ------------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------------

    /// Start a time-bounded scan, restarting one that is already running.
    pub async fn start_scan(&self) -> Result<(), SessionError> {
        let (scan_id, restart) = self.update(|inner, events| {
            if !inner.radio_on {
                return Err(SessionError::RadioOff);
            }
            let restart = match inner.state {
                SessionState::Idle => false,
                SessionState::Scanning => true,
                _ => {
                    return Err(SessionError::InvalidState {
                        operation: "scan",
                        state: inner.state.clone(),
                    })
                }
            };
            inner.scan_id += 1;
            inner.set_state(SessionState::Scanning, events);
            Ok((inner.scan_id, restart))
        })?;

        if restart {
            debug!("Restarting scan");
            self.stop_radio_scan().await;
        }

        let filters = self.settings.normalized_filters();
        let result = self
            .radio
            .start_scan(
                scan_id,
                &filters,
                self.settings.scan_duration_secs,
                self.settings.allow_duplicates,
            )
            .await;

        match result {
            Ok(()) => {
                info!(
                    "Scanning for {}s ({} service filters)",
                    self.settings.scan_duration_secs,
                    filters.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Scan request failed: {}", e);
                self.update(|inner, events| {
                    if inner.scan_id == scan_id && inner.state == SessionState::Scanning {
                        inner.set_state(SessionState::Idle, events);
                    }
                });
                Err(SessionError::ScanFailed(e))
            }
        }
    }

    /// Cancel the running scan. A no-op when no scan is running.
    pub async fn stop_scan(&self) -> Result<(), SessionError> {
        let scanning = self.update(|inner, events| match inner.state {
            SessionState::Scanning => {
                inner.set_state(SessionState::Idle, events);
                Ok(true)
            }
            SessionState::Idle => Ok(false),
            _ => Err(SessionError::InvalidState {
                operation: "stop scan",
                state: inner.state.clone(),
            }),
        })?;

        if !scanning {
            return Ok(());
        }

        if let Err(e) = self.radio.stop_scan().await {
            warn!("Stop scan failed: {}", e);
            return Err(SessionError::Radio(e));
        }
        info!("Scan stopped");
        Ok(())
    }

    /// Stop request on behalf of the session; its stop event is already stale
    async fn stop_radio_scan(&self) {
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Stop scan failed: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Connect to a catalogued peripheral and classify its characteristics.
    ///
    /// Only one attempt may be in flight. On failure the session is back in
    /// `Idle` with the record's connecting flag cleared.
    pub async fn connect(&self, peripheral_id: &str) -> Result<ServiceListing, SessionError> {
        let (attempt, was_scanning) = self.update(|inner, events| {
            match inner.state {
                SessionState::Connecting { .. } => return Err(SessionError::ConnectionInProgress),
                SessionState::Idle | SessionState::Scanning => {}
                _ => {
                    return Err(SessionError::InvalidState {
                        operation: "connect",
                        state: inner.state.clone(),
                    })
                }
            }
            if !inner.radio_on {
                return Err(SessionError::RadioOff);
            }
            if !inner.catalog.contains(peripheral_id) {
                return Err(SessionError::UnknownPeripheral(peripheral_id.to_string()));
            }

            let was_scanning = inner.state == SessionState::Scanning;
            inner.connect_attempt += 1;
            inner.catalog.set_connecting(peripheral_id, true);
            inner.set_state(
                SessionState::Connecting {
                    peripheral_id: peripheral_id.to_string(),
                },
                events,
            );
            events.push(SessionEvent::CatalogChanged);
            Ok((inner.connect_attempt, was_scanning))
        })?;

        if was_scanning {
            self.stop_radio_scan().await;
        }

        info!("Connecting to {}", peripheral_id);
        if let Err(e) = self.radio.connect(peripheral_id).await {
            warn!("Connect to {} failed: {}", peripheral_id, e);
            self.abort_connect(attempt, peripheral_id);
            return Err(SessionError::ConnectFailed(e));
        }

        if !self.inner.lock().attempt_is_current(attempt, peripheral_id) {
            debug!("Connect to {} superseded before service discovery", peripheral_id);
            self.release_radio_link(peripheral_id).await;
            return Err(SessionError::ConnectFailed(RadioError::Disconnected(
                peripheral_id.to_string(),
            )));
        }

        let listing = match self.radio.retrieve_services(peripheral_id).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Service discovery on {} failed: {}", peripheral_id, e);
                self.abort_connect(attempt, peripheral_id);
                self.release_radio_link(peripheral_id).await;
                return Err(SessionError::ServiceDiscoveryFailed(e));
            }
        };

        let established = self.update(|inner, events| {
            if !inner.attempt_is_current(attempt, peripheral_id) {
                return false;
            }
            inner.registry.rebuild(&listing);
            inner.catalog.set_connecting(peripheral_id, false);

            let mut record = inner
                .catalog
                .get(peripheral_id)
                .cloned()
                .unwrap_or_else(|| PeripheralRecord::new(peripheral_id, None));
            if record.name.is_none() {
                record.name = listing.name.clone();
            }
            inner.catalog.restrict_to(record);

            inner.clear_link_data();
            inner.link_peripheral = Some(peripheral_id.to_string());
            inner.link_epoch += 1;
            inner.set_state(
                SessionState::Connected {
                    peripheral_id: peripheral_id.to_string(),
                },
                events,
            );
            events.push(SessionEvent::CatalogChanged);
            true
        });

        if !established {
            debug!("Connect to {} superseded during service discovery", peripheral_id);
            self.release_radio_link(peripheral_id).await;
            return Err(SessionError::ConnectFailed(RadioError::Disconnected(
                peripheral_id.to_string(),
            )));
        }

        let index = self.capabilities();
        info!(
            "Connected to {}: {} read, {} write, {} write-without-response, {} notify",
            peripheral_id,
            index.read.len(),
            index.write.len(),
            index.write_without_response.len(),
            index.notify.len()
        );
        Ok(listing)
    }

    /// Connect to the record at `index` of the visible catalog
    pub async fn connect_at(&self, index: usize) -> Result<ServiceListing, SessionError> {
        let id = self.device_id_at(index)?;
        self.connect(&id).await
    }

    fn device_id_at(&self, index: usize) -> Result<String, SessionError> {
        self.inner
            .lock()
            .catalog
            .at(index)
            .map(|record| record.id)
            .ok_or_else(|| SessionError::UnknownPeripheral(format!("#{}", index)))
    }

    fn abort_connect(&self, attempt: u64, peripheral_id: &str) {
        self.update(|inner, events| {
            if inner.attempt_is_current(attempt, peripheral_id) {
                inner.cancel_connect(events);
            }
        });
    }

    /// Best-effort disconnect for a link the session will not use
    async fn release_radio_link(&self, peripheral_id: &str) {
        self.inner.lock().expect_own_disconnect(peripheral_id);
        if let Err(e) = self.radio.disconnect(peripheral_id).await {
            debug!("Releasing link to {} failed: {}", peripheral_id, e);
            self.inner.lock().forget_own_disconnect(peripheral_id);
        }
    }

    /// Disconnect the current peripheral and restore the full catalog view.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (peripheral_id, epoch) = self.update(|inner, events| {
            let id = match &inner.state {
                SessionState::Connected { peripheral_id } => peripheral_id.clone(),
                _ => return Err(SessionError::NotConnected),
            };
            inner.set_state(SessionState::Disconnecting, events);
            inner.expect_own_disconnect(&id);
            Ok((id, inner.link_epoch))
        })?;

        info!("Disconnecting from {}", peripheral_id);
        match self.radio.disconnect(&peripheral_id).await {
            Ok(()) => {
                self.update(|inner, events| {
                    if inner.link_epoch == epoch {
                        inner.teardown_link(events);
                    }
                });
                Ok(())
            }
            Err(e) => {
                let restored = self.update(|inner, events| {
                    inner.forget_own_disconnect(&peripheral_id);
                    if inner.link_epoch != epoch {
                        return false;
                    }
                    inner.set_state(
                        SessionState::Connected {
                            peripheral_id: peripheral_id.clone(),
                        },
                        events,
                    );
                    true
                });
                if restored {
                    warn!("Disconnect from {} failed: {}", peripheral_id, e);
                    Err(SessionError::DisconnectFailed(e))
                } else {
                    // The link went down by other means while the request was out
                    Ok(())
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Data transfer
    // ------------------------------------------------------------------------

    /// Write with acknowledgement to the `index`-th writable characteristic
    pub async fn write(&self, text: &str, index: usize) -> Result<(), SessionError> {
        self.transmit(text, index, Capability::Write).await
    }

    /// Write without acknowledgement to the `index`-th characteristic of that list
    pub async fn write_without_response(&self, text: &str, index: usize) -> Result<(), SessionError> {
        self.transmit(text, index, Capability::WriteWithoutResponse).await
    }

    async fn transmit(&self, text: &str, index: usize, capability: Capability) -> Result<(), SessionError> {
        if text.is_empty() {
            return Err(SessionError::EmptyPayload);
        }
        let target = self.inner.lock().link_target(capability, index)?;
        let payload = self.encode_outgoing(text)?;

        let LinkTarget {
            peripheral_id,
            characteristic,
            epoch,
        } = target;
        let result = match capability {
            Capability::WriteWithoutResponse => {
                self.radio
                    .write_without_response(
                        &peripheral_id,
                        &characteristic.service_uuid,
                        &characteristic.characteristic_uuid,
                        payload,
                    )
                    .await
            }
            _ => {
                self.radio
                    .write(
                        &peripheral_id,
                        &characteristic.service_uuid,
                        &characteristic.characteristic_uuid,
                        payload,
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.update(|inner, _| {
                    if inner.link_epoch == epoch {
                        inner.receive_buffer.clear();
                        inner.last_written = Some(text.to_string());
                    }
                });
                debug!("Wrote {} chars to {}", text.len(), characteristic);
                Ok(())
            }
            Err(e) => {
                warn!("Write to {} failed: {}", characteristic, e);
                Err(SessionError::WriteFailed(e))
            }
        }
    }

    fn encode_outgoing(&self, text: &str) -> Result<Vec<u8>, SessionError> {
        if self.settings.frame_outgoing {
            Ok(hex_to_bytes(&frame(text)?)?)
        } else {
            Ok(text_to_bytes(text))
        }
    }

    /// Read the `index`-th readable characteristic and decode it as text
    pub async fn read(&self, index: usize) -> Result<String, SessionError> {
        let target = self.inner.lock().link_target(Capability::Read, index)?;

        let bytes = self
            .radio
            .read(
                &target.peripheral_id,
                &target.characteristic.service_uuid,
                &target.characteristic.characteristic_uuid,
            )
            .await
            .map_err(|e| {
                warn!("Read from {} failed: {}", target.characteristic, e);
                SessionError::ReadFailed(e)
            })?;

        let text = bytes_to_text(&bytes);
        self.update(|inner, _| {
            if inner.link_epoch == target.epoch {
                inner.last_read = Some(text.clone());
            }
        });
        debug!("Read {} bytes from {}", bytes.len(), target.characteristic);
        Ok(text)
    }

    /// Subscribe to value updates from the `index`-th notifying characteristic
    pub async fn enable_notify(&self, index: usize) -> Result<CharacteristicRef, SessionError> {
        let target = self.inner.lock().link_target(Capability::Notify, index)?;

        self.radio
            .start_notification(
                &target.peripheral_id,
                &target.characteristic.service_uuid,
                &target.characteristic.characteristic_uuid,
            )
            .await
            .map_err(|e| {
                warn!("Enabling notifications on {} failed: {}", target.characteristic, e);
                SessionError::NotificationFailed(e)
            })?;

        self.update(|inner, _| {
            if inner.link_epoch == target.epoch && !inner.notifying.contains(&target.characteristic) {
                inner.notifying.push(target.characteristic.clone());
            }
        });
        info!("Notifications enabled on {}", target.characteristic);
        Ok(target.characteristic)
    }

    pub async fn disable_notify(&self, index: usize) -> Result<CharacteristicRef, SessionError> {
        let target = self.inner.lock().link_target(Capability::Notify, index)?;

        self.radio
            .stop_notification(
                &target.peripheral_id,
                &target.characteristic.service_uuid,
                &target.characteristic.characteristic_uuid,
            )
            .await
            .map_err(|e| {
                warn!("Disabling notifications on {} failed: {}", target.characteristic, e);
                SessionError::NotificationFailed(e)
            })?;

        self.update(|inner, _| {
            if inner.link_epoch == target.epoch {
                inner.notifying.retain(|c| *c != target.characteristic);
            }
        });
        info!("Notifications disabled on {}", target.characteristic);
        Ok(target.characteristic)
    }

    // ------------------------------------------------------------------------
    // Pass-through requests
    // ------------------------------------------------------------------------

    /// Ask the radio to re-emit its power state
    pub async fn check_state(&self) -> Result<(), SessionError> {
        self.radio.check_state().await.map_err(SessionError::Radio)
    }

    /// Ask the user to turn Bluetooth on
    pub async fn enable_radio(&self) -> Result<(), SessionError> {
        self.radio.enable().await.map_err(|e| {
            warn!("Enable request failed: {}", e);
            SessionError::Radio(e)
        })
    }

    pub async fn read_rssi(&self, peripheral_id: &str) -> Result<i16, SessionError> {
        self.radio.read_rssi(peripheral_id).await.map_err(SessionError::Radio)
    }

    pub async fn is_peripheral_connected(&self, peripheral_id: &str) -> Result<bool, SessionError> {
        self.radio.is_connected(peripheral_id).await.map_err(SessionError::Radio)
    }

    pub async fn connected_peripherals(&self) -> Result<Vec<PeripheralRecord>, SessionError> {
        self.radio.connected_peripherals().await.map_err(SessionError::Radio)
    }

    pub async fn discovered_peripherals(&self) -> Result<Vec<PeripheralRecord>, SessionError> {
        self.radio.discovered_peripherals().await.map_err(SessionError::Radio)
    }

    pub async fn bonded_peripherals(&self) -> Result<Vec<PeripheralRecord>, SessionError> {
        self.radio.bonded_peripherals().await.map_err(SessionError::Radio)
    }

    /// Bond with the connected peripheral
    pub async fn create_bond(&self) -> Result<(), SessionError> {
        let peripheral_id = match self.state() {
            SessionState::Connected { peripheral_id } => peripheral_id,
            _ => return Err(SessionError::NotConnected),
        };
        self.radio.create_bond(&peripheral_id).await.map_err(|e| {
            warn!("Bonding with {} failed: {}", peripheral_id, e);
            SessionError::Radio(e)
        })
    }

    /// Forget a peripheral in the radio cache and the catalog
    pub async fn remove_peripheral(&self, peripheral_id: &str) -> Result<(), SessionError> {
        {
            let inner = self.inner.lock();
            let linked = inner.state.peripheral_id() == Some(peripheral_id)
                || inner.link_peripheral.as_deref() == Some(peripheral_id);
            if linked {
                return Err(SessionError::InvalidState {
                    operation: "remove peripheral",
                    state: inner.state.clone(),
                });
            }
        }

        self.radio
            .remove_peripheral(peripheral_id)
            .await
            .map_err(SessionError::Radio)?;

        self.update(|inner, events| {
            if inner.catalog.remove(peripheral_id).is_some() {
                events.push(SessionEvent::CatalogChanged);
            }
        });
        info!("Removed peripheral {}", peripheral_id);
        Ok(())
    }

    pub async fn remove_peripheral_at(&self, index: usize) -> Result<(), SessionError> {
        let id = self.device_id_at(index)?;
        self.remove_peripheral(&id).await
    }

    // ------------------------------------------------------------------------
    // Radio events
    // ------------------------------------------------------------------------

    /// Apply one asynchronous radio event
    pub async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Power(power) => self.on_power(power).await,
            RadioEvent::ScanStopped(scan_id) => self.on_scan_stopped(scan_id),
            RadioEvent::Discovered(record) => self.on_discovered(record),
            RadioEvent::Connection(event) => self.on_connection(event),
            RadioEvent::Value(update) => self.on_value(update),
        }
    }

    async fn on_power(&self, power: PowerState) {
        let auto_scan = self.update(|inner, events| {
            let on = power == PowerState::On;
            if inner.radio_on != on {
                info!("Bluetooth turned {}", if on { "on" } else { "off" });
                inner.radio_on = on;
                events.push(SessionEvent::RadioPowerChanged(on));
            }

            if on {
                return self.settings.auto_scan_on_power_on && inner.state == SessionState::Idle;
            }

            // Nothing the radio had in flight will report back
            inner.own_disconnects.clear();
            match inner.state {
                SessionState::Idle => {}
                SessionState::Scanning => inner.set_state(SessionState::Idle, events),
                SessionState::Connecting { .. } => inner.cancel_connect(events),
                SessionState::Connected { .. } | SessionState::Disconnecting => {
                    inner.teardown_link(events)
                }
            }
            false
        });

        if auto_scan {
            if let Err(e) = self.start_scan().await {
                warn!("Automatic scan failed: {}", e);
            }
        }
    }

    fn on_scan_stopped(&self, scan_id: u64) {
        self.update(|inner, events| {
            if scan_id != inner.scan_id {
                debug!("Discarding stop of superseded scan {}", scan_id);
                return;
            }
            if inner.state == SessionState::Scanning {
                info!("Scan finished");
                inner.set_state(SessionState::Idle, events);
            }
        });
    }

    fn on_discovered(&self, mut record: PeripheralRecord) {
        self.update(|inner, events| {
            if let Some(existing) = inner.catalog.get(&record.id) {
                record.connecting = existing.connecting;
            } else {
                debug!("Discovered {} ({})", record.id, record.display_name());
            }
            inner.catalog.upsert(record);
            events.push(SessionEvent::CatalogChanged);
        });
    }

    fn on_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { peripheral_id, status } => {
                debug!("Link up for {} (status {})", peripheral_id, status);
            }
            ConnectionEvent::Disconnected { peripheral_id, status } => self.update(|inner, events| {
                if inner.forget_own_disconnect(&peripheral_id) {
                    debug!("Disconnect of {} was requested by the session", peripheral_id);
                    return;
                }
                let current = inner.state.peripheral_id() == Some(peripheral_id.as_str());
                let linked = inner.link_peripheral.as_deref() == Some(peripheral_id.as_str());
                match inner.state {
                    SessionState::Connected { .. } if current => {
                        info!("{} disconnected (status {})", peripheral_id, status);
                        inner.teardown_link(events);
                    }
                    SessionState::Disconnecting if linked => inner.teardown_link(events),
                    SessionState::Connecting { .. } if current => {
                        info!("{} dropped while connecting (status {})", peripheral_id, status);
                        inner.cancel_connect(events);
                    }
                    _ => debug!("Ignoring disconnect of non-current peripheral {}", peripheral_id),
                }
            }),
        }
    }

    fn on_value(&self, update: ValueUpdate) {
        let accepted = self.update(|inner, events| {
            let current = inner.state.is_connected()
                && inner.state.peripheral_id() == Some(update.peripheral_id.as_str());
            if !current {
                debug!(
                    "Ignoring value from non-current peripheral {} ({})",
                    update.peripheral_id, update.characteristic_uuid
                );
                return None;
            }
            let hex = update.value.to_uppercase();
            inner.receive_buffer.push(hex.clone());
            events.push(SessionEvent::DataReceived(hex.clone()));
            Some(hex)
        });

        if let Some(hex) = accepted {
            self.sink.on_payload(&update.peripheral_id, &hex);
        }
    }
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("settings", &self.settings)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
