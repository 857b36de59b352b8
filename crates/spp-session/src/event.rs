//! Session events
//!
//! Discrete notifications published on a broadcast channel next to the
//! state snapshot. The snapshot says where the session *is*; events say what
//! just *happened* (a device turned up, the peer hung up), which is what a
//! front-end turns into toasts and log lines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConnectFailureKind;
use crate::types::{AdapterState, Capability, DiscoveredDevice, PermissionStatus};

/// How a discovery session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// The radio reported the natural end of the inquiry
    Completed {
        /// Devices in the registry at the end
        devices: usize,
    },
    /// The transport reported an error
    Failed {
        /// Error description
        reason: String,
    },
    /// Stopped by an intent or by radio power loss
    Cancelled,
}

/// Why a connection went back to idle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Explicit disconnect intent
    Requested,
    /// Input stream ended
    PeerClosed,
    /// Read or write error on the socket
    StreamError {
        /// Error description
        message: String,
    },
    /// Radio turned off
    AdapterOff,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnected"),
            DisconnectReason::PeerClosed => write!(f, "device disconnected"),
            DisconnectReason::StreamError { message } => write!(f, "connection lost: {}", message),
            DisconnectReason::AdapterOff => write!(f, "bluetooth turned off"),
        }
    }
}

/// Events emitted by the session coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Radio power state changed
    AdapterStateChanged(AdapterState),

    /// A permission request or probe finished
    PermissionsResolved {
        /// Status per capability
        statuses: BTreeMap<Capability, PermissionStatus>,
    },

    /// Discovery entered Scanning
    ScanStarted,

    /// A new device entered the registry
    DeviceDiscovered(DiscoveredDevice),

    /// Discovery went back to Idle
    ScanFinished(ScanOutcome),

    /// Connect attempt issued
    Connecting {
        /// Target address
        address: String,
    },

    /// Socket open, streams bound
    Connected {
        /// Peer address
        address: String,
    },

    /// Connect attempt failed
    ConnectFailed {
        /// Target address
        address: String,
        /// Failure class
        kind: ConnectFailureKind,
        /// Error description
        reason: String,
    },

    /// Decoded text chunk appended to the received buffer
    DataReceived {
        /// Peer address
        address: String,
        /// Decoded chunk
        text: String,
    },

    /// A line was written and flushed
    LineSent {
        /// Peer address
        address: String,
        /// Line without terminator
        text: String,
    },

    /// Connection returned to Idle
    Disconnected {
        /// Peer address
        address: String,
        /// Why
        reason: DisconnectReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::PeerClosed.to_string(), "device disconnected");
        assert!(DisconnectReason::StreamError {
            message: "reset".into()
        }
        .to_string()
        .contains("reset"));
    }

    #[test]
    fn test_scan_outcome_serde_tag() {
        let json = serde_json::to_string(&ScanOutcome::Completed { devices: 2 }).unwrap();
        assert_eq!(json, r#"{"outcome":"completed","devices":2}"#);
    }
}
