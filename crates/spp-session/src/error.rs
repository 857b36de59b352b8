//! Error types for session manager operations
//!
//! Every failure the core can produce resolves to one of these variants.
//! None of them is fatal to the process: callers get a structured outcome
//! and the session is left either unchanged or back in `Idle`.

use std::io;
use thiserror::Error;

use crate::types::{AdapterState, Capability};

/// Coarse classification of a failed connect attempt
///
/// Derived from the transport's error signal. It only shapes the message
/// shown to the user; retry behaviour is identical for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectFailureKind {
    /// The OS refused access to the radio
    Permission,
    /// Peer out of range, switched off or already serving another client
    Unavailable,
    /// Socket-level failure during the handshake
    Transport,
    /// Anything else
    Unknown,
}

impl ConnectFailureKind {
    /// Classify an I/O error returned by a connection transport
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => return Self::Permission,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::AddrInUse => return Self::Unavailable,
            io::ErrorKind::TimedOut
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => return Self::Transport,
            _ => {}
        }

        // Platform stacks often report everything as `Other` with a message
        let message = err.to_string().to_lowercase();
        if message.contains("permission") || message.contains("not allowed") {
            Self::Permission
        } else if message.contains("unavailable")
            || message.contains("not available")
            || message.contains("busy")
            || message.contains("host is down")
            || message.contains("refused")
        {
            Self::Unavailable
        } else if message.contains("socket")
            || message.contains("read failed")
            || message.contains("timeout")
            || message.contains("timed out")
        {
            Self::Transport
        } else {
            Self::Unknown
        }
    }

    /// Short human readable hint for this failure class
    pub fn hint(&self) -> &'static str {
        match self {
            ConnectFailureKind::Permission => "Bluetooth permission was not granted",
            ConnectFailureKind::Unavailable => {
                "device is unavailable, out of range or busy with another connection"
            }
            ConnectFailureKind::Transport => "the serial socket could not be opened",
            ConnectFailureKind::Unknown => "the connection could not be established",
        }
    }
}

impl std::fmt::Display for ConnectFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailureKind::Permission => write!(f, "permission"),
            ConnectFailureKind::Unavailable => write!(f, "unavailable"),
            ConnectFailureKind::Transport => write!(f, "transport"),
            ConnectFailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

fn permanence_note(permanent: &bool) -> &'static str {
    if *permanent {
        " (change it in system settings)"
    } else {
        ""
    }
}

/// Main error type for session operations
#[derive(Error, Debug)]
pub enum SessionError {
    // ===== Precondition Errors =====
    /// One or more capabilities were not granted
    #[error("Permission denied for {denied:?}{}", permanence_note(.permanent))]
    PermissionDenied {
        /// Capabilities that are not granted
        denied: Vec<Capability>,
        /// At least one of them can only be changed from system settings
        permanent: bool,
    },

    /// The radio is not powered on
    #[error("Bluetooth adapter is not on (state: {0})")]
    AdapterNotOn(AdapterState),

    // ===== Caller Misuse =====
    /// A scan is already running
    #[error("Discovery is already running")]
    AlreadyScanning,

    /// A connection is already open or being opened
    #[error("Already connected or connecting to {address}")]
    AlreadyConnected {
        /// Address of the existing session
        address: String,
    },

    /// No connection is open
    #[error("Not connected")]
    NotConnected,

    // ===== Transport Errors =====
    /// Connect attempt failed
    #[error("Connect to {address} failed ({kind}): {reason}")]
    ConnectFailed {
        /// Target address
        address: String,
        /// Failure class
        kind: ConnectFailureKind,
        /// Transport supplied reason
        reason: String,
    },

    /// Connect attempt did not complete in time
    #[error("Connect to {address} timed out after {duration_ms}ms")]
    ConnectTimeout {
        /// Target address
        address: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Connect attempt was aborted by a disconnect or radio power loss
    #[error("Connect to {address} was cancelled")]
    ConnectCancelled {
        /// Target address
        address: String,
    },

    /// Write or flush failed; the connection stays open
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The discovery transport refused to start
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// Platform collaborator reported an error
    #[error("Platform error: {0}")]
    Platform(String),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Check if the user can fix this and retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied { .. }
                | SessionError::AdapterNotOn(_)
                | SessionError::ConnectFailed { .. }
                | SessionError::ConnectTimeout { .. }
                | SessionError::ConnectCancelled { .. }
                | SessionError::SendFailed(_)
                | SessionError::DiscoveryFailed(_)
        )
    }

    /// Check if the intent was issued in a state that does not allow it
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyScanning
                | SessionError::AlreadyConnected { .. }
                | SessionError::NotConnected
        )
    }

    /// Build the error for a failed connect attempt
    pub fn connect_failed(address: impl Into<String>, err: &io::Error) -> Self {
        SessionError::ConnectFailed {
            address: address.into(),
            kind: ConnectFailureKind::classify(err),
            reason: err.to_string(),
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied { .. } => "PERMISSION_DENIED",
            SessionError::AdapterNotOn(_) => "ADAPTER_NOT_ON",
            SessionError::AlreadyScanning => "ALREADY_SCANNING",
            SessionError::AlreadyConnected { .. } => "ALREADY_CONNECTED",
            SessionError::NotConnected => "NOT_CONNECTED",
            SessionError::ConnectFailed { .. } => "CONNECT_FAILED",
            SessionError::ConnectTimeout { .. } => "CONNECT_TIMEOUT",
            SessionError::ConnectCancelled { .. } => "CONNECT_CANCELLED",
            SessionError::SendFailed(_) => "SEND_FAILED",
            SessionError::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            SessionError::Platform(_) => "PLATFORM_ERROR",
            SessionError::InvalidConfig(_) => "INVALID_CONFIG",
            SessionError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

// Conversion from serde_json error (configuration files)
impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::InvalidConfig(err.to_string())
    }
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for SessionError {
    fn from(err: bluer::Error) -> Self {
        SessionError::Platform(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SessionError::AlreadyScanning.error_code(), "ALREADY_SCANNING");
        assert_eq!(
            SessionError::AdapterNotOn(AdapterState::Off).error_code(),
            "ADAPTER_NOT_ON"
        );

        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        assert_eq!(SessionError::from(parse).error_code(), "INVALID_CONFIG");
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert_eq!(SessionError::from(io).error_code(), "IO_ERROR");
    }

    #[test]
    fn test_recoverable_vs_misuse() {
        assert!(SessionError::AdapterNotOn(AdapterState::Off).is_recoverable());
        assert!(SessionError::SendFailed("broken pipe".into()).is_recoverable());
        assert!(!SessionError::NotConnected.is_recoverable());
        assert!(SessionError::NotConnected.is_caller_misuse());
        assert!(SessionError::AlreadyConnected {
            address: "AA:BB".into()
        }
        .is_caller_misuse());
    }

    #[test]
    fn test_classify_by_kind() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Permission);

        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Unavailable);

        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Transport);
    }

    #[test]
    fn test_classify_by_message() {
        let err = io::Error::other("read failed, socket might closed or timeout");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Transport);

        let err = io::Error::other("Device is busy");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Unavailable);

        let err = io::Error::other("something odd");
        assert_eq!(ConnectFailureKind::classify(&err), ConnectFailureKind::Unknown);
    }

    #[test]
    fn test_permission_denied_message() {
        let err = SessionError::PermissionDenied {
            denied: vec![Capability::Location],
            permanent: true,
        };
        assert!(err.to_string().contains("system settings"));
    }
}
