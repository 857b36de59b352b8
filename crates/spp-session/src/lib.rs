//! Bluetooth Classic serial session manager
//!
//! Discovers nearby Bluetooth Classic devices, opens an RFCOMM (Serial Port
//! Profile) link to one of them and exchanges line-oriented text over it,
//! while following the radio's power state and the OS permission model.
//!
//! # Architecture
//!
//! The crate is split into four layers:
//!
//! 1. **Platform seam** - async traits for permissions, radio power,
//!    inquiry and RFCOMM connect ([`platform`])
//! 2. **Components** - [`PermissionGate`], [`AdapterStateTracker`],
//!    [`DiscoverySession`], [`ConnectionSession`]
//! 3. **State** - one [`SessionStore`] holding the [`SessionSnapshot`] and
//!    publishing [`SessionEvent`]s
//! 4. **Coordinator** - [`SessionCoordinator`], which turns user intents into
//!    component calls and serializes them per resource
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use spp_session::{SessionConfigBuilder, SessionCoordinator};
//! use spp_session::test_utils::MockPlatform;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfigBuilder::new()
//!         .line_terminator("\r\n")
//!         .build()?;
//!
//!     let coordinator = SessionCoordinator::new(MockPlatform::simulated().platform(), config)?;
//!     coordinator.start().await?;
//!
//!     coordinator.request_scan().await?;
//!     let mut snapshots = coordinator.subscribe();
//!     snapshots.wait_for(|s| !s.is_scanning()).await?;
//!
//!     let first = coordinator.snapshot().devices.devices()[0].address.clone();
//!     coordinator.request_connect(&first).await?;
//!     coordinator.request_send("AT").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `bluez` - BlueZ backend for Linux (requires `libdbus-1-dev`)
//!
//! # Guarantees
//!
//! - The registry holds each address once, in first-seen order, and never
//!   holds a device without a name.
//! - No sighting reaches the registry after a stop has returned.
//! - No inbound chunk reaches the receive buffer after a teardown has begun.
//! - When the radio turns off, the snapshot reports the connection closing
//!   and discovery idle in the same update that reports the radio off.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core types
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod snapshot;
pub mod types;

// Platform seam
pub mod platform;

// Components
pub mod adapter;
pub mod connection;
pub mod discovery;
pub mod permission;

// Coordinator
pub mod coordinator;

// Testing utilities
pub mod test_utils;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{ConnectFailureKind, Result, SessionError};
pub use event::{DisconnectReason, ScanOutcome, SessionEvent};
pub use registry::{DeviceRegistry, Rejection};
pub use snapshot::{ConnectionState, DiscoveryState, SessionSnapshot, SessionStore};
pub use types::{AdapterState, Capability, DiscoveredDevice, PermissionStatus, Sighting};

pub use platform::{
    ConnectionTransport, DiscoveryTransport, PermissionProvider, Platform, RadioAdapter,
    SerialLink, UnrestrictedPermissions,
};

#[cfg(feature = "bluez")]
pub use platform::BluezPlatform;

pub use adapter::AdapterStateTracker;
pub use connection::ConnectionSession;
pub use discovery::DiscoverySession;
pub use permission::{PermissionGate, PermissionOutcome};

pub use coordinator::SessionCoordinator;

pub use test_utils::{ConnectBehavior, MockPeer, MockPlatform};

pub use config::{DEFAULT_EVENT_CAPACITY, DEFAULT_LINE_TERMINATOR, DEFAULT_RFCOMM_CHANNEL};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_LINE_TERMINATOR, "\r\n");
        assert_eq!(DEFAULT_RFCOMM_CHANNEL, 1);
        assert!(DEFAULT_EVENT_CAPACITY > 0);
    }
}
