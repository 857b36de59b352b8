//! Core value types shared by every component
//!
//! Radio power state, OS capabilities and their permission status, and the
//! device records produced by discovery.

use serde::{Deserialize, Serialize};

/// Power state of the local Bluetooth radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// State could not be determined
    #[default]
    Unknown,
    /// Radio is powered and usable
    On,
    /// Radio is powering up
    TurningOn,
    /// Radio is off
    Off,
    /// Radio is powering down
    TurningOff,
}

impl AdapterState {
    /// Radio operations are allowed only in this state
    pub fn is_on(&self) -> bool {
        matches!(self, AdapterState::On)
    }

    /// States that force every session to tear down
    pub fn is_powering_down(&self) -> bool {
        matches!(self, AdapterState::Off | AdapterState::TurningOff)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "unknown"),
            AdapterState::On => write!(f, "on"),
            AdapterState::TurningOn => write!(f, "turning on"),
            AdapterState::Off => write!(f, "off"),
            AdapterState::TurningOff => write!(f, "turning off"),
        }
    }
}

/// OS capability needed before a radio operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Permission to run discovery
    ScanRadio,
    /// Permission to open sockets to peers
    ConnectRadio,
    /// Location access, required for discovery on some platforms
    Location,
}

impl Capability {
    /// Everything a scan-then-connect session needs, in prompt order
    pub const ALL: [Capability; 3] = [
        Capability::ScanRadio,
        Capability::ConnectRadio,
        Capability::Location,
    ];
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::ScanRadio => write!(f, "bluetooth scan"),
            Capability::ConnectRadio => write!(f, "bluetooth connect"),
            Capability::Location => write!(f, "location"),
        }
    }
}

/// Permission status of a single capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// The user has not been asked yet
    #[default]
    NotDetermined,
    /// Access granted
    Granted,
    /// Refused, may be asked again
    Denied,
    /// Refused for good; only system settings can change it
    PermanentlyDenied,
}

impl PermissionStatus {
    /// Whether the capability may be used
    pub fn is_granted(&self) -> bool {
        matches!(self, PermissionStatus::Granted)
    }

    /// Whether prompting again can change the outcome
    pub fn can_prompt(&self) -> bool {
        matches!(self, PermissionStatus::NotDetermined | PermissionStatus::Denied)
    }
}

/// Raw discovery report as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Device address
    pub address: String,
    /// Advertised name, if the stack resolved one
    pub display_name: Option<String>,
}

impl Sighting {
    /// Create a sighting
    pub fn new(address: impl Into<String>, display_name: Option<&str>) -> Self {
        Self {
            address: address.into(),
            display_name: display_name.map(str::to_string),
        }
    }
}

/// A device kept in the registry
///
/// Identity is the address; the first sighting of an address wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device address (registry key)
    pub address: String,
    /// Display name from the first sighting
    pub display_name: Option<String>,
}

impl DiscoveredDevice {
    /// Create a device record
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: Some(display_name.into()),
        }
    }

    /// Name for display, falling back to the address
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_state_gates() {
        assert!(AdapterState::On.is_on());
        assert!(!AdapterState::TurningOn.is_on());
        assert!(AdapterState::Off.is_powering_down());
        assert!(AdapterState::TurningOff.is_powering_down());
        assert!(!AdapterState::Unknown.is_powering_down());
    }

    #[test]
    fn test_permission_status_prompting() {
        assert!(PermissionStatus::NotDetermined.can_prompt());
        assert!(PermissionStatus::Denied.can_prompt());
        assert!(!PermissionStatus::PermanentlyDenied.can_prompt());
        assert!(!PermissionStatus::Granted.can_prompt());
    }

    #[test]
    fn test_device_display() {
        let device = DiscoveredDevice::new("11:22", "HC-05");
        assert_eq!(device.to_string(), "HC-05 (11:22)");
        assert_eq!(device.label(), "HC-05");
    }

    #[test]
    fn test_adapter_state_serde() {
        let json = serde_json::to_string(&AdapterState::TurningOff).unwrap();
        assert_eq!(json, "\"turning_off\"");
    }
}
