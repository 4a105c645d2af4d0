//! Characteristic capability registry
//!
//! After service discovery the peripheral reports a listing of
//! (service, characteristic, properties). The property shape differs per
//! platform: a name→name map on one, a list of names on the other. Both are
//! folded into [`CharacteristicDescriptor`] at the boundary, so
//! classification below never branches on platform.
//!
//! Indices into a [`CapabilityIndex`] list are only meaningful for the
//! connection that produced it; the index is rebuilt on every connect.

use crate::codec::normalize_uuid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Capability a characteristic declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Read,
    /// Write with acknowledgement
    Write,
    WriteWithoutResponse,
    Notify,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Read,
        Capability::Write,
        Capability::WriteWithoutResponse,
        Capability::Notify,
    ];

    /// Map a platform property name to a capability; unrelated properties
    /// (Indicate, Broadcast, ...) yield `None`.
    pub fn from_property_name(name: &str) -> Option<Self> {
        match name {
            "Read" => Some(Capability::Read),
            "Write" => Some(Capability::Write),
            "WriteWithoutResponse" => Some(Capability::WriteWithoutResponse),
            "Notify" => Some(Capability::Notify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "Read",
            Capability::Write => "Write",
            Capability::WriteWithoutResponse => "WriteWithoutResponse",
            Capability::Notify => "Notify",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform-specific property representation as delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyFlags {
    /// `{"Read": "Read", "Notify": "Notify"}`; a property counts only when it maps to its own name
    Keyed(HashMap<String, String>),
    /// `["Read", "Notify"]`
    Listed(Vec<String>),
}

impl PropertyFlags {
    /// Capabilities declared, in canonical order
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        match self {
            PropertyFlags::Keyed(map) => map
                .iter()
                .filter(|(name, value)| name == value)
                .filter_map(|(name, _)| Capability::from_property_name(name))
                .collect(),
            PropertyFlags::Listed(names) => names
                .iter()
                .filter_map(|name| Capability::from_property_name(name))
                .collect(),
        }
    }
}

impl Default for PropertyFlags {
    fn default() -> Self {
        PropertyFlags::Listed(Vec::new())
    }
}

/// One entry of a raw service-discovery listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCharacteristic {
    pub service: String,
    pub characteristic: String,
    #[serde(default)]
    pub properties: PropertyFlags,
}

/// Service-discovery response for one peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub characteristics: Vec<RawCharacteristic>,
}

impl ServiceListing {
    /// Normalise every entry, preserving order
    pub fn descriptors(&self) -> Vec<CharacteristicDescriptor> {
        self.characteristics
            .iter()
            .map(CharacteristicDescriptor::from_raw)
            .collect()
    }
}

/// Address of a characteristic on the connected peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    pub service_uuid: String,
    pub characteristic_uuid: String,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_uuid, self.characteristic_uuid)
    }
}

/// Canonical characteristic description with normalised 128-bit UUIDs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDescriptor {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub capabilities: BTreeSet<Capability>,
}

impl CharacteristicDescriptor {
    pub fn new(service: &str, characteristic: &str, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            service_uuid: normalize_uuid(service),
            characteristic_uuid: normalize_uuid(characteristic),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn from_raw(raw: &RawCharacteristic) -> Self {
        Self::new(&raw.service, &raw.characteristic, raw.properties.capabilities())
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn reference(&self) -> CharacteristicRef {
        CharacteristicRef {
            service_uuid: self.service_uuid.clone(),
            characteristic_uuid: self.characteristic_uuid.clone(),
        }
    }
}

/// Four independently ordered lists, one per capability.
///
/// Position `i` in one list has no relation to position `i` in another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityIndex {
    pub read: Vec<CharacteristicRef>,
    pub write: Vec<CharacteristicRef>,
    pub write_without_response: Vec<CharacteristicRef>,
    pub notify: Vec<CharacteristicRef>,
}

impl CapabilityIndex {
    pub fn list(&self, capability: Capability) -> &[CharacteristicRef] {
        match capability {
            Capability::Read => &self.read,
            Capability::Write => &self.write,
            Capability::WriteWithoutResponse => &self.write_without_response,
            Capability::Notify => &self.notify,
        }
    }

    fn list_mut(&mut self, capability: Capability) -> &mut Vec<CharacteristicRef> {
        match capability {
            Capability::Read => &mut self.read,
            Capability::Write => &mut self.write,
            Capability::WriteWithoutResponse => &mut self.write_without_response,
            Capability::Notify => &mut self.notify,
        }
    }

    /// Characteristic at `index` in the list for `capability`
    pub fn get(&self, capability: Capability, index: usize) -> Option<&CharacteristicRef> {
        self.list(capability).get(index)
    }

    pub fn is_empty(&self) -> bool {
        Capability::ALL.iter().all(|c| self.list(*c).is_empty())
    }

    pub fn clear(&mut self) {
        for capability in Capability::ALL {
            self.list_mut(capability).clear();
        }
    }
}

/// Build the capability index for a listing, preserving input order.
///
/// A characteristic lands in every list it supports; one with no recognised
/// capability lands in none.
pub fn classify(descriptors: &[CharacteristicDescriptor]) -> CapabilityIndex {
    let mut index = CapabilityIndex::default();
    for descriptor in descriptors {
        for capability in &descriptor.capabilities {
            index.list_mut(*capability).push(descriptor.reference());
        }
    }
    index
}

/// Capability index owned by the session for the current connection
#[derive(Debug, Clone, Default)]
pub struct CharacteristicRegistry {
    descriptors: Vec<CharacteristicDescriptor>,
    index: CapabilityIndex,
}

impl CharacteristicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset, then classify a fresh listing
    pub fn rebuild(&mut self, listing: &ServiceListing) -> &CapabilityIndex {
        self.reset();
        self.descriptors = listing.descriptors();
        self.index = classify(&self.descriptors);
        &self.index
    }

    pub fn reset(&mut self) {
        self.descriptors.clear();
        self.index.clear();
    }

    pub fn index(&self) -> &CapabilityIndex {
        &self.index
    }

    pub fn descriptors(&self) -> &[CharacteristicDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, capability: Capability, index: usize) -> Option<&CharacteristicRef> {
        self.index.get(capability, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(names: &[&str]) -> PropertyFlags {
        PropertyFlags::Keyed(names.iter().map(|n| (n.to_string(), n.to_string())).collect())
    }

    fn listed(names: &[&str]) -> PropertyFlags {
        PropertyFlags::Listed(names.iter().map(|n| n.to_string()).collect())
    }

    fn raw(service: &str, characteristic: &str, properties: PropertyFlags) -> RawCharacteristic {
        RawCharacteristic {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
            properties,
        }
    }

    #[test]
    fn test_classify_read_notify_and_write() {
        let descriptors = vec![
            CharacteristicDescriptor::new("fff0", "fff1", [Capability::Read, Capability::Notify]),
            CharacteristicDescriptor::new("fff0", "fff2", [Capability::Write]),
        ];

        let index = classify(&descriptors);

        assert_eq!(index.read, vec![descriptors[0].reference()]);
        assert_eq!(index.notify, vec![descriptors[0].reference()]);
        assert_eq!(index.write, vec![descriptors[1].reference()]);
        assert!(index.write_without_response.is_empty());
    }

    #[test]
    fn test_both_property_shapes_normalise_identically() {
        let android = raw("fff0", "fff1", keyed(&["Read", "WriteWithoutResponse"]));
        let ios = raw("FFF0", "FFF1", listed(&["Read", "WriteWithoutResponse"]));

        assert_eq!(
            CharacteristicDescriptor::from_raw(&android),
            CharacteristicDescriptor::from_raw(&ios)
        );
    }

    #[test]
    fn test_keyed_property_requires_matching_value() {
        let mut map = HashMap::new();
        map.insert("Read".to_string(), "Read".to_string());
        map.insert("Notify".to_string(), "false".to_string());
        let caps = PropertyFlags::Keyed(map).capabilities();

        assert!(caps.contains(&Capability::Read));
        assert!(!caps.contains(&Capability::Notify));
    }

    #[test]
    fn test_unknown_properties_are_ignored_but_characteristic_kept() {
        let listing = ServiceListing {
            id: "A1".to_string(),
            name: None,
            characteristics: vec![raw("180a", "2a29", listed(&["Indicate", "Broadcast"]))],
        };

        let mut registry = CharacteristicRegistry::new();
        let index = registry.rebuild(&listing);

        assert!(index.is_empty());
        assert_eq!(registry.descriptors().len(), 1);
    }

    #[test]
    fn test_order_preserved_per_list() {
        let listing = ServiceListing {
            id: "A1".to_string(),
            name: None,
            characteristics: vec![
                raw("fff0", "fff1", listed(&["Write"])),
                raw("fff0", "fff2", listed(&["Read"])),
                raw("fff0", "fff3", listed(&["Write", "Read"])),
            ],
        };

        let mut registry = CharacteristicRegistry::new();
        registry.rebuild(&listing);

        let writes: Vec<_> = registry.index().write.iter().map(|r| r.characteristic_uuid.clone()).collect();
        let reads: Vec<_> = registry.index().read.iter().map(|r| r.characteristic_uuid.clone()).collect();
        assert_eq!(writes, vec![normalize_uuid("fff1"), normalize_uuid("fff3")]);
        assert_eq!(reads, vec![normalize_uuid("fff2"), normalize_uuid("fff3")]);
    }

    #[test]
    fn test_rebuild_discards_previous_connection() {
        let mut registry = CharacteristicRegistry::new();
        registry.rebuild(&ServiceListing {
            id: "A1".to_string(),
            name: None,
            characteristics: vec![raw("fff0", "fff1", listed(&["Notify"]))],
        });
        registry.rebuild(&ServiceListing {
            id: "B2".to_string(),
            name: None,
            characteristics: vec![raw("fff0", "fff2", listed(&["Read"]))],
        });

        assert!(registry.index().notify.is_empty());
        assert_eq!(registry.index().read.len(), 1);

        registry.reset();
        assert!(registry.index().is_empty());
        assert!(registry.get(Capability::Read, 0).is_none());
    }

    #[test]
    fn test_listing_deserialises_both_shapes() {
        let json = r#"{
            "id": "A1",
            "characteristics": [
                {"service": "fff0", "characteristic": "fff1", "properties": {"Read": "Read", "Notify": "Notify"}},
                {"service": "fff0", "characteristic": "fff2", "properties": ["Write"]}
            ]
        }"#;

        let listing: ServiceListing = serde_json::from_str(json).unwrap();
        let index = classify(&listing.descriptors());

        assert_eq!(index.read.len(), 1);
        assert_eq!(index.notify.len(), 1);
        assert_eq!(index.write.len(), 1);
        assert_eq!(index.write[0].service_uuid, "0000FFF0-0000-1000-8000-00805F9B34FB");
    }
}
