//! Ordered, address-deduplicated device registry
//!
//! Discovery stacks report the same device many times during one scan (every
//! inquiry response, every name resolution). The registry keeps exactly one
//! entry per address, in the order devices were first seen. Later sightings
//! never replace an existing entry.

use serde::Serialize;
use std::collections::HashSet;
use tracing::trace;

use crate::types::{DiscoveredDevice, Sighting};

/// Why a sighting did not produce a new registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Address was empty
    MissingAddress,
    /// Name was missing or empty
    MissingName,
    /// Address is already registered
    Duplicate,
}

/// Discovered devices in first-seen order
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceRegistry {
    devices: Vec<DiscoveredDevice>,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting
    ///
    /// Returns the new entry, or the reason the sighting was dropped.
    pub fn insert(&mut self, sighting: Sighting) -> Result<&DiscoveredDevice, Rejection> {
        if sighting.address.trim().is_empty() {
            return Err(Rejection::MissingAddress);
        }
        let name = match sighting.display_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(Rejection::MissingName),
        };
        if !self.seen.insert(sighting.address.clone()) {
            trace!(address = %sighting.address, "Ignoring repeated sighting");
            return Err(Rejection::Duplicate);
        }

        self.devices.push(DiscoveredDevice {
            address: sighting.address,
            display_name: Some(name),
        });
        Ok(&self.devices[self.devices.len() - 1])
    }

    /// Forget every device
    pub fn clear(&mut self) {
        self.devices.clear();
        self.seen.clear();
    }

    /// Whether the address has been seen
    pub fn contains(&self, address: &str) -> bool {
        self.seen.contains(address)
    }

    /// Look up a device by address
    pub fn get(&self, address: &str) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    /// Devices in first-seen order
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }

    /// Iterate devices in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.devices.iter()
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether nothing has been discovered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl PartialEq for DeviceRegistry {
    fn eq(&self, other: &Self) -> bool {
        self.devices == other.devices
    }
}

impl Eq for DeviceRegistry {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sighting(address: &str, name: &str) -> Sighting {
        Sighting::new(address, Some(name))
    }

    #[test]
    fn test_first_seen_order() {
        let mut registry = DeviceRegistry::new();
        for (addr, name) in [("A", "a"), ("B", "b"), ("A", "a2"), ("C", "c")] {
            let _ = registry.insert(sighting(addr, name));
        }

        let addresses: Vec<_> = registry.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["A", "B", "C"]);
        // First sighting wins, later names are ignored
        assert_eq!(registry.get("A").unwrap().display_name.as_deref(), Some("a"));
    }

    #[test]
    fn test_rejections() {
        let mut registry = DeviceRegistry::new();
        assert_eq!(
            registry.insert(sighting("", "x")).unwrap_err(),
            Rejection::MissingAddress
        );
        assert_eq!(
            registry.insert(Sighting::new("11:22", None)).unwrap_err(),
            Rejection::MissingName
        );
        assert_eq!(
            registry.insert(sighting("11:22", "")).unwrap_err(),
            Rejection::MissingName
        );
        assert!(registry.insert(sighting("11:22", "X")).is_ok());
        assert_eq!(
            registry.insert(sighting("11:22", "X")).unwrap_err(),
            Rejection::Duplicate
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_nameless_sighting_does_not_claim_address() {
        let mut registry = DeviceRegistry::new();
        let _ = registry.insert(Sighting::new("11:22", None));
        assert!(!registry.contains("11:22"));
        assert!(registry.insert(sighting("11:22", "late name")).is_ok());
    }

    #[test]
    fn test_clear() {
        let mut registry = DeviceRegistry::new();
        let _ = registry.insert(sighting("A", "a"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.insert(sighting("A", "a")).is_ok());
    }
}
