//! Configuration types for the session manager
//!
//! Framing of outgoing lines, optional hardening timeouts, and hints used by
//! platform backends. Durations are written in humantime format
//! (`"5s"`, `"250ms"`) when serialized.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SessionError};

/// Line terminator appended to every sent line
pub const DEFAULT_LINE_TERMINATOR: &str = "\r\n";

/// Upper bound on waiting for a radio that is still turning on
pub const DEFAULT_ADAPTER_SETTLE_MS: u64 = 5000;

/// Capacity of the session event broadcast channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How long a backend keeps an inquiry running before reporting completion
pub const DEFAULT_SCAN_DURATION_MS: u64 = 12_000;

/// RFCOMM channel used when the backend does not resolve one through SDP
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Main configuration for a session coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Terminator appended to every outgoing line
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,

    /// Give up on a connect handshake after this long (transport default when unset)
    #[serde(with = "humantime_serde_opt", default)]
    pub connect_timeout: Option<Duration>,

    /// Give up on a write + flush after this long
    #[serde(with = "humantime_serde_opt", default)]
    pub send_timeout: Option<Duration>,

    /// How long a scan intent waits for a radio that is turning on
    #[serde(with = "humantime_serde", default = "default_adapter_settle_timeout")]
    pub adapter_settle_timeout: Duration,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Backend hint: length of one inquiry
    #[serde(with = "humantime_serde", default = "default_scan_duration")]
    pub scan_duration: Duration,

    /// Backend hint: RFCOMM channel to connect to
    #[serde(default = "default_rfcomm_channel")]
    pub rfcomm_channel: u8,
}

fn default_line_terminator() -> String {
    DEFAULT_LINE_TERMINATOR.to_string()
}

fn default_adapter_settle_timeout() -> Duration {
    Duration::from_millis(DEFAULT_ADAPTER_SETTLE_MS)
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_scan_duration() -> Duration {
    Duration::from_millis(DEFAULT_SCAN_DURATION_MS)
}

fn default_rfcomm_channel() -> u8 {
    DEFAULT_RFCOMM_CHANNEL
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_terminator: default_line_terminator(),
            connect_timeout: None,
            send_timeout: None,
            adapter_settle_timeout: default_adapter_settle_timeout(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            scan_duration: default_scan_duration(),
            rfcomm_channel: DEFAULT_RFCOMM_CHANNEL,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Reject values the session cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.line_terminator.is_empty() {
            return Err(SessionError::InvalidConfig(
                "line_terminator must not be empty".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SessionError::InvalidConfig(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.rfcomm_channel == 0 || self.rfcomm_channel > 30 {
            return Err(SessionError::InvalidConfig(format!(
                "rfcomm_channel {} outside 1..=30",
                self.rfcomm_channel
            )));
        }
        Ok(())
    }
}

/// Builder for SessionConfig
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the terminator appended to sent lines
    pub fn line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.config.line_terminator = terminator.into();
        self
    }

    /// Bound the connect handshake
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Bound each write + flush
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = Some(timeout);
        self
    }

    /// Set how long a scan waits for the radio to finish turning on
    pub fn adapter_settle_timeout(mut self, timeout: Duration) -> Self {
        self.config.adapter_settle_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Set the inquiry length hint
    pub fn scan_duration(mut self, duration: Duration) -> Self {
        self.config.scan_duration = duration;
        self
    }

    /// Set the RFCOMM channel hint
    pub fn rfcomm_channel(mut self, channel: u8) -> Self {
        self.config.rfcomm_channel = channel;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod humantime_serde_opt {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
