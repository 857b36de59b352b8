//! Observable session state
//!
//! All components write into one [`SessionStore`]. Every mutation happens
//! under a single lock and is republished on a `watch` channel, so a reader
//! of the snapshot never sees a half-applied transition (for example the
//! adapter reported off while the connection still reads as open).

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::event::{DisconnectReason, ScanOutcome, SessionEvent};
use crate::registry::DeviceRegistry;
use crate::types::{AdapterState, Capability, PermissionStatus};

/// Discovery lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    /// No inquiry running
    #[default]
    Idle,
    /// Inquiry running, sightings flowing into the registry
    Scanning,
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket
    #[default]
    Idle,
    /// Handshake in flight
    Connecting,
    /// Streams bound, text flowing
    Open,
    /// Tearing down; no further input is accepted
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Radio power state
    pub adapter_state: AdapterState,
    /// Last known permission status per capability
    pub capabilities: BTreeMap<Capability, PermissionStatus>,
    /// Discovery lifecycle
    pub discovery_state: DiscoveryState,
    /// Devices from the current or last scan
    pub devices: DeviceRegistry,
    /// Connection lifecycle
    pub connection_state: ConnectionState,
    /// Peer address while the connection is open
    pub connected_address: Option<String>,
    /// Text received on the current connection
    pub received_text: String,
    /// How the last scan ended
    pub last_scan_outcome: Option<ScanOutcome>,
    /// Why the last connection ended
    pub last_disconnect: Option<DisconnectReason>,
}

impl SessionSnapshot {
    /// Whether a connection is open
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Open
    }

    /// Whether an inquiry is running
    pub fn is_scanning(&self) -> bool {
        self.discovery_state == DiscoveryState::Scanning
    }
}

/// Snapshot plus bookkeeping that is not part of the public view
#[derive(Debug, Default)]
pub(crate) struct Tracked {
    pub(crate) snapshot: SessionSnapshot,
    /// Bumped on every scan start and stop; stale sighting pumps compare against it
    pub(crate) scan_epoch: u64,
    /// Bumped on every connect attempt and teardown; stale readers compare against it
    pub(crate) link_epoch: u64,
    /// Address of the connect attempt in flight or the open peer
    pub(crate) target_address: Option<String>,
}

/// Shared, observable session state
pub struct SessionStore {
    tracked: Mutex<Tracked>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new(event_capacity: usize) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            tracked: Mutex::new(Tracked::default()),
            snapshot_tx,
            event_tx,
        })
    }

    /// Apply a mutation and republish the snapshot if it changed
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Tracked) -> R) -> R {
        let mut tracked = self.tracked.lock();
        let result = f(&mut tracked);
        self.snapshot_tx.send_if_modified(|current| {
            if *current != tracked.snapshot {
                *current = tracked.snapshot.clone();
                true
            } else {
                false
            }
        });
        result
    }

    /// Read under the lock
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Tracked) -> R) -> R {
        f(&self.tracked.lock())
    }

    /// Publish an event; dropped when nobody listens
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.tracked.lock().snapshot.clone()
    }

    /// Watch the snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Receive events published from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("snapshot", &self.tracked.lock().snapshot)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_publishes_changes() {
        let store = SessionStore::new(8);
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store.update(|t| t.snapshot.adapter_state = AdapterState::On);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().adapter_state, AdapterState::On);

        // Identical state does not wake watchers
        store.update(|t| t.snapshot.adapter_state = AdapterState::On);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_bookkeeping_not_published() {
        let store = SessionStore::new(8);
        let rx = store.subscribe();
        store.update(|t| t.link_epoch += 1);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(store.read(|t| t.link_epoch), 1);
    }

    #[tokio::test]
    async fn test_events_fan_out() {
        let store = SessionStore::new(8);
        let mut a = store.events();
        let mut b = store.events();
        store.emit(SessionEvent::ScanStarted);
        assert_eq!(a.recv().await.unwrap(), SessionEvent::ScanStarted);
        assert_eq!(b.recv().await.unwrap(), SessionEvent::ScanStarted);
    }
}
