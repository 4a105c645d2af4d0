//! Discovered peripheral catalog
//!
//! Keeps one record per device id in first-discovery order. While a
//! connection is up the visible list narrows to the connected record; the
//! full list is kept underneath and comes back on disconnect.

use crate::codec::mac_from_advertising;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Advertising payload attached to a discovery event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingData {
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power_level: Option<i16>,
    pub is_connectable: Option<bool>,
    #[serde(default)]
    pub service_uuids: Vec<String>,
    /// Manufacturer-specific data, hex encoded
    pub manufacturer_data: Option<String>,
    /// Raw manufacturer MAC string, e.g. `<80eaca 000001>`
    pub manufacturer_mac_address: Option<String>,
}

impl AdvertisingData {
    /// Big-endian, colon separated MAC when the advertisement carries one
    pub fn mac_address(&self) -> Option<String> {
        self.manufacturer_mac_address
            .as_deref()
            .and_then(mac_from_advertising)
    }
}

/// A discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralRecord {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub advertising: AdvertisingData,
    #[serde(default)]
    pub connecting: bool,
}

impl PeripheralRecord {
    pub fn new(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            advertising: AdvertisingData::default(),
            connecting: false,
        }
    }

    pub fn with_advertising(mut self, advertising: AdvertisingData) -> Self {
        self.advertising = advertising;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.advertising.local_name.as_deref())
            .unwrap_or("Unknown")
    }
}

/// Deduplicated, insertion-ordered collection of discovered peripherals
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    records: Vec<PeripheralRecord>,
    positions: HashMap<String, usize>,
    /// When set, only this id is visible
    focus: Option<String>,
}

impl DeviceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record at the end, or overwrite an existing one in place.
    pub fn upsert(&mut self, record: PeripheralRecord) {
        match self.positions.get(&record.id) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.positions.insert(record.id.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Visible records in stored order
    pub fn snapshot(&self) -> Vec<PeripheralRecord> {
        match &self.focus {
            Some(id) => self.get(id).cloned().into_iter().collect(),
            None => self.records.clone(),
        }
    }

    /// Narrow the visible list to a single record (inserting it if needed)
    pub fn restrict_to(&mut self, record: PeripheralRecord) {
        let id = record.id.clone();
        self.upsert(record);
        self.focus = Some(id);
    }

    /// Bring back the full multi-device view
    pub fn restore(&mut self) {
        self.focus = None;
    }

    pub fn is_restricted(&self) -> bool {
        self.focus.is_some()
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralRecord> {
        self.positions.get(id).map(|&pos| &self.records[pos])
    }

    /// Record at a position of the visible list
    pub fn at(&self, index: usize) -> Option<PeripheralRecord> {
        self.snapshot().into_iter().nth(index)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Set the connecting flag; returns false for unknown ids
    pub fn set_connecting(&mut self, id: &str, connecting: bool) -> bool {
        match self.positions.get(id) {
            Some(&pos) => {
                self.records[pos].connecting = connecting;
                true
            }
            None => false,
        }
    }

    /// Drop a record entirely (explicit cache removal)
    pub fn remove(&mut self, id: &str) -> Option<PeripheralRecord> {
        let pos = self.positions.remove(id)?;
        let record = self.records.remove(pos);
        for p in self.positions.values_mut() {
            if *p > pos {
                *p -= 1;
            }
        }
        if self.focus.as_deref() == Some(id) {
            self.focus = None;
        }
        Some(record)
    }

    /// Number of visible records
    pub fn len(&self) -> usize {
        match &self.focus {
            Some(id) => usize::from(self.contains(id)),
            None => self.records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.positions.clear();
        self.focus = None;
    }
}
