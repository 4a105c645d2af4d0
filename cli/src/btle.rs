// Desktop radio driver on top of btleplug
//
// Peripherals are identified by their Bluetooth address string. Adapter
// events and per-peripheral notification streams are pumped into the
// session's RadioEventHub by background tasks owned by the radio.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use gattlink_core::codec::{bytes_to_hex, normalize_uuid};
use gattlink_core::{
    AdvertisingData, ConnectionEvent, PeripheralRecord, PowerState, PropertyFlags, RadioBridge,
    RadioError, RadioEvent, RadioEventHub, RawCharacteristic, ServiceListing, ValueUpdate,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PROPERTY_NAMES: [(CharPropFlags, &str); 6] = [
    (CharPropFlags::BROADCAST, "Broadcast"),
    (CharPropFlags::READ, "Read"),
    (CharPropFlags::WRITE_WITHOUT_RESPONSE, "WriteWithoutResponse"),
    (CharPropFlags::WRITE, "Write"),
    (CharPropFlags::NOTIFY, "Notify"),
    (CharPropFlags::INDICATE, "Indicate"),
];

/// btleplug property bits as the name list the registry understands
fn property_flags(flags: CharPropFlags) -> PropertyFlags {
    PropertyFlags::Listed(
        PROPERTY_NAMES
            .iter()
            .filter(|(flag, _)| flags.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect(),
    )
}

/// Lowest company id first, little-endian id followed by the payload
fn manufacturer_hex(data: &HashMap<u16, Vec<u8>>) -> Option<String> {
    data.iter().min_by_key(|(company, _)| **company).map(|(company, payload)| {
        let mut raw = company.to_le_bytes().to_vec();
        raw.extend_from_slice(payload);
        bytes_to_hex(&raw)
    })
}

fn parse_uuid(text: &str) -> Result<Uuid, RadioError> {
    Uuid::parse_str(&normalize_uuid(text))
        .map_err(|e| RadioError::Platform(format!("invalid UUID {:?}: {}", text, e)))
}

fn radio_error(err: btleplug::Error) -> RadioError {
    match err {
        btleplug::Error::TimedOut(_) => RadioError::Timeout,
        other => RadioError::Platform(other.to_string()),
    }
}

async fn record_for(peripheral: &Peripheral) -> PeripheralRecord {
    let id = peripheral.address().to_string();
    match peripheral.properties().await.ok().flatten() {
        Some(properties) => {
            let advertising = AdvertisingData {
                local_name: properties.local_name.clone(),
                rssi: properties.rssi,
                tx_power_level: properties.tx_power_level,
                is_connectable: None,
                service_uuids: properties
                    .services
                    .iter()
                    .map(|uuid| normalize_uuid(&uuid.to_string()))
                    .collect(),
                manufacturer_data: manufacturer_hex(&properties.manufacturer_data),
                manufacturer_mac_address: None,
            };
            PeripheralRecord::new(id, properties.local_name).with_advertising(advertising)
        }
        None => PeripheralRecord::new(id, None),
    }
}

/// Notification forwarding tasks keyed by peripheral id
type Forwarders = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

fn stop_forwarder(forwarders: &Forwarders, peripheral_id: &str) {
    if let Some(task) = forwarders.lock().remove(peripheral_id) {
        task.abort();
    }
}

/// Forward adapter events into the hub until the adapter stream ends
async fn pump_adapter_events<S>(
    adapter: Adapter,
    mut events: S,
    hub: RadioEventHub,
    report_duplicates: Arc<AtomicBool>,
    forwarders: Forwarders,
) where
    S: Stream<Item = CentralEvent> + Unpin + Send + 'static,
{
    while let Some(event) = events.next().await {
        // None for discoveries, Some(link up) for connection changes
        let (id, link) = match event {
            CentralEvent::DeviceDiscovered(id) => (id, None),
            CentralEvent::DeviceUpdated(id) if report_duplicates.load(Ordering::Relaxed) => (id, None),
            CentralEvent::DeviceConnected(id) => (id, Some(true)),
            CentralEvent::DeviceDisconnected(id) => (id, Some(false)),
            _ => continue,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                debug!("Event for unknown peripheral: {}", e);
                continue;
            }
        };

        let Some(connected) = link else {
            hub.publish(RadioEvent::Discovered(record_for(&peripheral).await));
            continue;
        };

        let peripheral_id = peripheral.address().to_string();
        let event = if connected {
            ConnectionEvent::Connected { peripheral_id, status: 0 }
        } else {
            stop_forwarder(&forwarders, &peripheral_id);
            ConnectionEvent::Disconnected { peripheral_id, status: 0 }
        };
        hub.publish(RadioEvent::Connection(event));
    }
    debug!("Adapter event stream ended");
}

// ============================================================================
// RADIO
// ============================================================================

pub struct BtleplugRadio {
    adapter: Adapter,
    hub: RadioEventHub,
    request_timeout: Duration,
    report_duplicates: Arc<AtomicBool>,
    event_pump: JoinHandle<()>,
    /// Latest scan id and the timer that ends it
    scan_timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    forwarders: Forwarders,
}

impl BtleplugRadio {
    /// Open the adapter at `adapter_index` and start pumping its events into `hub`
    pub async fn open(
        adapter_index: usize,
        request_timeout: Duration,
        hub: RadioEventHub,
    ) -> anyhow::Result<Self> {
        use anyhow::Context;

        let manager = Manager::new()
            .await
            .context("Failed to open the Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .nth(adapter_index)
            .with_context(|| format!("No Bluetooth adapter at index {}", adapter_index))?;

        let events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let report_duplicates = Arc::new(AtomicBool::new(true));
        let forwarders = Forwarders::default();
        let event_pump = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            events,
            hub.clone(),
            Arc::clone(&report_duplicates),
            Arc::clone(&forwarders),
        ));

        info!("Using Bluetooth adapter #{}", adapter_index);
        Ok(Self {
            adapter,
            hub,
            request_timeout,
            report_duplicates,
            event_pump,
            scan_timer: Mutex::new(None),
            forwarders,
        })
    }

    async fn timed<T, F>(&self, request: F) -> Result<T, RadioError>
    where
        F: Future<Output = Result<T, btleplug::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(radio_error),
            Err(_) => Err(RadioError::Timeout),
        }
    }

    async fn find_peripheral(&self, peripheral_id: &str) -> Result<Peripheral, RadioError> {
        self.timed(self.adapter.peripherals())
            .await?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(peripheral_id))
            .ok_or_else(|| RadioError::PeripheralNotFound(peripheral_id.to_string()))
    }

    async fn find_characteristic(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(Peripheral, Characteristic), RadioError> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        let service = parse_uuid(service_uuid)?;
        let uuid = parse_uuid(characteristic_uuid)?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or_else(|| {
                RadioError::CharacteristicNotFound(format!("{}/{}", service_uuid, characteristic_uuid))
            })?;
        Ok((peripheral, characteristic))
    }

    /// Start forwarding notifications of `peripheral` unless already running
    async fn ensure_forwarder(&self, peripheral_id: &str, peripheral: &Peripheral) -> Result<(), RadioError> {
        let running = self
            .forwarders
            .lock()
            .get(peripheral_id)
            .map_or(false, |task| !task.is_finished());
        if running {
            return Ok(());
        }

        let mut notifications = self.timed(peripheral.notifications()).await?;
        let hub = self.hub.clone();
        let source = peripheral.clone();
        let id = peripheral_id.to_string();

        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let service_uuid = source
                    .characteristics()
                    .iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| normalize_uuid(&c.service_uuid.to_string()))
                    .unwrap_or_default();
                hub.publish(RadioEvent::Value(ValueUpdate {
                    peripheral_id: id.clone(),
                    service_uuid,
                    characteristic_uuid: normalize_uuid(&notification.uuid.to_string()),
                    value: bytes_to_hex(&notification.value),
                }));
            }
            debug!("Notification stream for {} ended", id);
        });

        if let Some(previous) = self.forwarders.lock().insert(peripheral_id.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        self.event_pump.abort();
        if let Some((_, timer)) = self.scan_timer.lock().take() {
            timer.abort();
        }
        for (_, task) in self.forwarders.lock().drain() {
            task.abort();
        }
    }
}

#[async_trait]
impl RadioBridge for BtleplugRadio {
    async fn check_state(&self) -> Result<(), RadioError> {
        let power = match self.timed(self.adapter.adapter_info()).await {
            Ok(info) => {
                debug!("Adapter: {}", info);
                PowerState::On
            }
            Err(e) => {
                warn!("Adapter unavailable: {}", e);
                PowerState::Off
            }
        };
        self.hub.publish(RadioEvent::Power(power));
        Ok(())
    }

    async fn enable(&self) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("enabling the adapter"))
    }

    async fn start_scan(
        &self,
        scan_id: u64,
        service_filters: &[String],
        duration_secs: u64,
        allow_duplicates: bool,
    ) -> Result<(), RadioError> {
        let services = service_filters
            .iter()
            .map(|filter| parse_uuid(filter))
            .collect::<Result<Vec<_>, _>>()?;
        self.report_duplicates.store(allow_duplicates, Ordering::Relaxed);

        self.timed(self.adapter.start_scan(ScanFilter { services })).await?;

        let adapter = self.adapter.clone();
        let hub = self.hub.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
            if let Err(e) = adapter.stop_scan().await {
                warn!("Stopping expired scan failed: {}", e);
            }
            hub.publish(RadioEvent::ScanStopped(scan_id));
        });
        if let Some((_, previous)) = self.scan_timer.lock().replace((scan_id, timer)) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        let running = self.scan_timer.lock().take();
        let scan_id = running.map(|(scan_id, timer)| {
            timer.abort();
            scan_id
        });
        self.timed(self.adapter.stop_scan()).await?;
        if let Some(scan_id) = scan_id {
            self.hub.publish(RadioEvent::ScanStopped(scan_id));
        }
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<(), RadioError> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        self.timed(peripheral.connect()).await
    }

    async fn retrieve_services(&self, peripheral_id: &str) -> Result<ServiceListing, RadioError> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        self.timed(peripheral.discover_services()).await?;

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        let characteristics = peripheral
            .characteristics()
            .into_iter()
            .map(|c| RawCharacteristic {
                service: c.service_uuid.to_string(),
                characteristic: c.uuid.to_string(),
                properties: property_flags(c.properties),
            })
            .collect();

        Ok(ServiceListing {
            id: peripheral_id.to_string(),
            name,
            characteristics,
        })
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<(), RadioError> {
        stop_forwarder(&self.forwarders, peripheral_id);
        let peripheral = self.find_peripheral(peripheral_id).await?;
        self.timed(peripheral.disconnect()).await
    }

    async fn write(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self
            .find_characteristic(peripheral_id, service_uuid, characteristic_uuid)
            .await?;
        self.timed(peripheral.write(&characteristic, &payload, WriteType::WithResponse))
            .await
    }

    async fn write_without_response(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
        payload: Vec<u8>,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self
            .find_characteristic(peripheral_id, service_uuid, characteristic_uuid)
            .await?;
        self.timed(peripheral.write(&characteristic, &payload, WriteType::WithoutResponse))
            .await
    }

    async fn read(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<Vec<u8>, RadioError> {
        let (peripheral, characteristic) = self
            .find_characteristic(peripheral_id, service_uuid, characteristic_uuid)
            .await?;
        self.timed(peripheral.read(&characteristic)).await
    }

    async fn start_notification(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self
            .find_characteristic(peripheral_id, service_uuid, characteristic_uuid)
            .await?;
        self.ensure_forwarder(peripheral_id, &peripheral).await?;
        self.timed(peripheral.subscribe(&characteristic)).await
    }

    async fn stop_notification(
        &self,
        peripheral_id: &str,
        service_uuid: &str,
        characteristic_uuid: &str,
    ) -> Result<(), RadioError> {
        let (peripheral, characteristic) = self
            .find_characteristic(peripheral_id, service_uuid, characteristic_uuid)
            .await?;
        self.timed(peripheral.unsubscribe(&characteristic)).await
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16, RadioError> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        self.timed(peripheral.properties())
            .await?
            .and_then(|p| p.rssi)
            .ok_or_else(|| RadioError::Platform(format!("no RSSI reported for {}", peripheral_id)))
    }

    async fn is_connected(&self, peripheral_id: &str) -> Result<bool, RadioError> {
        let peripheral = self.find_peripheral(peripheral_id).await?;
        self.timed(peripheral.is_connected()).await
    }

    async fn connected_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        let mut records = Vec::new();
        for peripheral in self.timed(self.adapter.peripherals()).await? {
            if peripheral.is_connected().await.unwrap_or(false) {
                records.push(record_for(&peripheral).await);
            }
        }
        Ok(records)
    }

    async fn discovered_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        let mut records = Vec::new();
        for peripheral in self.timed(self.adapter.peripherals()).await? {
            records.push(record_for(&peripheral).await);
        }
        Ok(records)
    }

    async fn bonded_peripherals(&self) -> Result<Vec<PeripheralRecord>, RadioError> {
        Err(RadioError::Unsupported("listing bonded peripherals"))
    }

    async fn create_bond(&self, _peripheral_id: &str) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("bonding"))
    }

    async fn remove_peripheral(&self, _peripheral_id: &str) -> Result<(), RadioError> {
        Err(RadioError::Unsupported("removing cached peripherals"))
    }
}
