//! SessionCoordinator - the single entry point for a front-end
//!
//! Owns the four components, keeps one observable snapshot of all of them and
//! turns user intents into component calls.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     SessionCoordinator                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  intents ──► scan queue ──► PermissionGate ─► DiscoverySession│
//! │          ──► connect queue ─────────────────► ConnectionSession
//! │                                                              │
//! │  AdapterStateTracker ──► power-down teardown                 │
//! │                                                              │
//! │  all of the above ──► SessionStore ──► watch<SessionSnapshot>│
//! │                                    └─► broadcast<SessionEvent>│
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ordering
//!
//! Intents on one resource (scan or connection) run one at a time, in the
//! order they were issued; the two resources are independent. A connect
//! holds both queues, so no scan can start while a handshake is in flight.
//! `request_stop_scan` and `request_disconnect` skip the queues: they act on
//! whatever is running, including an intent that is still waiting on it.
//!
//! # Example
//!
//! ```rust,ignore
//! use spp_session::{SessionConfig, SessionCoordinator};
//!
//! let coordinator = SessionCoordinator::new(platform, SessionConfig::default())?;
//! coordinator.start().await?;
//!
//! let mut snapshots = coordinator.subscribe();
//! coordinator.request_scan().await?;
//! coordinator.request_connect("98:D3:31:F5:12:34").await?;
//! coordinator.request_send("AT").await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::adapter::AdapterStateTracker;
use crate::config::SessionConfig;
use crate::connection::ConnectionSession;
use crate::discovery::DiscoverySession;
use crate::error::{Result, SessionError};
use crate::event::{DisconnectReason, SessionEvent};
use crate::permission::{PermissionGate, PermissionOutcome};
use crate::platform::Platform;
use crate::snapshot::{SessionSnapshot, SessionStore};
use crate::types::{AdapterState, Capability, PermissionStatus};

struct Inner {
    config: SessionConfig,
    store: Arc<SessionStore>,
    gate: Arc<PermissionGate>,
    adapter: Arc<AdapterStateTracker>,
    discovery: Arc<DiscoverySession>,
    connection: Arc<ConnectionSession>,
    scan_queue: Mutex<()>,
    connect_queue: Mutex<()>,
}

impl Inner {
    /// Apply a power transition to the snapshot and release what it invalidates
    async fn on_adapter_state(&self, state: AdapterState) {
        let (halted, teardown) = self.store.update(|t| {
            t.snapshot.adapter_state = state;
            if !state.is_powering_down() {
                return (false, None);
            }
            let halted = DiscoverySession::halt(t);
            let teardown = ConnectionSession::begin_teardown(t);
            t.snapshot.devices.clear();
            (halted, teardown)
        });
        self.store.emit(SessionEvent::AdapterStateChanged(state));

        if halted || teardown.is_some() {
            warn!(%state, scan = halted, link = teardown.is_some(), "Radio powering down, releasing resources");
        }
        self.discovery.release(halted).await;
        if let Some(teardown) = teardown {
            self.connection
                .finish_teardown(teardown, DisconnectReason::AdapterOff)
                .await;
        }
    }
}

/// Session manager handle
///
/// Cheap to clone; every clone drives the same session.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator over `platform`
    pub fn new(platform: Platform, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let store = SessionStore::new(config.event_capacity);
        let gate = Arc::new(PermissionGate::new(platform.permissions, store.clone()));
        let adapter = Arc::new(AdapterStateTracker::new(platform.adapter));
        let discovery = Arc::new(DiscoverySession::new(
            platform.discovery,
            gate.clone(),
            store.clone(),
        ));
        let connection = Arc::new(ConnectionSession::new(
            platform.connector,
            gate.clone(),
            store.clone(),
            &config,
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                gate,
                adapter,
                discovery,
                connection,
                scan_queue: Mutex::new(()),
                connect_queue: Mutex::new(()),
            }),
        })
    }

    /// Read the initial adapter state and permissions and follow power changes
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.adapter.current_state().await;
        inner.on_adapter_state(state).await;
        inner.gate.check_all().await;

        let weak: Weak<Inner> = Arc::downgrade(inner);
        inner
            .adapter
            .subscribe(move |state| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_adapter_state(state).await;
                    }
                }
            })
            .await?;

        info!(adapter = %state, "Session coordinator started");
        Ok(())
    }

    /// Disconnect, stop discovery and stop following the adapter
    pub async fn shutdown(&self) {
        self.inner.adapter.unsubscribe();
        self.inner.discovery.stop().await;
        self.inner.connection.disconnect().await;
        info!("Session coordinator shut down");
    }

    // ===== Observation =====

    /// Watch the snapshot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.store.subscribe()
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.store.snapshot()
    }

    /// Receive events published from now on
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.store.events()
    }

    /// Active configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ===== Intents =====

    /// Resolve permissions, make sure the radio is on, then scan
    pub async fn request_scan(&self) -> Result<()> {
        let _queue = self.inner.scan_queue.lock().await;
        if self.inner.discovery.is_scanning() {
            return Err(SessionError::AlreadyScanning);
        }

        self.inner.gate.request_all().await?.into_result()?;
        self.ensure_adapter_on().await?;
        self.inner.discovery.start().await
    }

    /// Stop the running scan; no-op when idle
    pub async fn request_stop_scan(&self) -> Result<()> {
        self.inner.discovery.stop().await;
        Ok(())
    }

    /// Stop discovery, then connect to `address`
    pub async fn request_connect(&self, address: &str) -> Result<()> {
        let _connect = self.inner.connect_queue.lock().await;
        if let Some(existing) = self.inner.connection.active_address() {
            return Err(SessionError::AlreadyConnected { address: existing });
        }

        let _scan = self.inner.scan_queue.lock().await;
        if self.inner.discovery.is_scanning() {
            info!(address, "Stopping discovery before connecting");
            self.inner.discovery.stop().await;
        }
        self.inner.connection.connect(address).await
    }

    /// Close the link or abandon a connect in flight; never fails
    pub async fn request_disconnect(&self) -> Result<()> {
        self.inner.connection.disconnect().await;
        Ok(())
    }

    /// Send one line
    pub async fn request_send(&self, text: &str) -> Result<()> {
        self.inner.connection.send(text).await
    }

    /// Send the user to system settings
    pub async fn open_system_settings(&self) -> Result<()> {
        self.inner.gate.open_system_settings().await
    }

    /// Probe permissions again without prompting
    pub async fn refresh_permissions(&self) -> BTreeMap<Capability, PermissionStatus> {
        self.inner.gate.check_all().await
    }

    /// Prompt for every capability without starting anything
    pub async fn request_permissions(&self) -> Result<PermissionOutcome> {
        self.inner.gate.request_all().await
    }

    // ===== Components =====

    /// Permission gate
    pub fn permissions(&self) -> &PermissionGate {
        &self.inner.gate
    }

    /// Adapter tracker
    pub fn adapter(&self) -> &AdapterStateTracker {
        &self.inner.adapter
    }

    /// Discovery session
    pub fn discovery(&self) -> &DiscoverySession {
        &self.inner.discovery
    }

    /// Connection session
    pub fn connection(&self) -> &ConnectionSession {
        &self.inner.connection
    }

    async fn ensure_adapter_on(&self) -> Result<()> {
        let mut state = self.inner.store.read(|t| t.snapshot.adapter_state);
        if state == AdapterState::Unknown {
            let queried = self.inner.adapter.current_state().await;
            state = self.inner.store.update(|t| {
                if t.snapshot.adapter_state == AdapterState::Unknown {
                    t.snapshot.adapter_state = queried;
                }
                t.snapshot.adapter_state
            });
        }
        if state == AdapterState::TurningOn {
            let settle = self.inner.config.adapter_settle_timeout;
            debug!(?settle, "Waiting for the radio to turn on");
            self.inner
                .adapter
                .wait_for_state(|s| *s != AdapterState::TurningOn, settle)
                .await;
            state = self.inner.store.read(|t| t.snapshot.adapter_state);
        }
        if state.is_on() {
            Ok(())
        } else {
            Err(SessionError::AdapterNotOn(state))
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("snapshot", &self.inner.store.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ConnectionState, DiscoveryState};
    use crate::test_utils::{wait_for_snapshot, MockPlatform};
    use std::time::Duration;

    async fn started(mock: &MockPlatform) -> SessionCoordinator {
        let coordinator = SessionCoordinator::new(mock.platform(), SessionConfig::default()).unwrap();
        coordinator.start().await.unwrap();
        coordinator
    }

    #[tokio::test]
    async fn test_start_reads_adapter_and_permissions() {
        let mock = MockPlatform::new();
        let coordinator = started(&mock).await;
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.adapter_state, AdapterState::On);
        assert_eq!(snapshot.capabilities.len(), 3);
        assert_eq!(mock.permissions.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = SessionConfig::default();
        config.line_terminator.clear();
        let result = SessionCoordinator::new(MockPlatform::new().platform(), config);
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_scan_with_adapter_off() {
        let mock = MockPlatform::new();
        mock.adapter.set_state(AdapterState::Off);
        let coordinator = started(&mock).await;
        assert!(matches!(
            coordinator.request_scan().await,
            Err(SessionError::AdapterNotOn(AdapterState::Off))
        ));
        assert_eq!(mock.discovery.start_count(), 0);
    }

    #[tokio::test]
    async fn test_scan_waits_for_radio_turning_on() {
        let mock = MockPlatform::new();
        mock.adapter.set_state(AdapterState::TurningOn);
        let coordinator = started(&mock).await;

        let adapter = mock.adapter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            adapter.set_state(AdapterState::On);
        });

        coordinator.request_scan().await.unwrap();
        assert_eq!(coordinator.snapshot().discovery_state, DiscoveryState::Scanning);
    }

    #[tokio::test]
    async fn test_scan_denied_permissions() {
        let mock = MockPlatform::new();
        mock.permissions
            .set_status(Capability::Location, PermissionStatus::PermanentlyDenied);
        let coordinator = started(&mock).await;

        let err = coordinator.request_scan().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::PermissionDenied { permanent: true, .. }
        ));
        assert!(err.is_recoverable());
        assert_eq!(mock.discovery.start_count(), 0);

        coordinator.open_system_settings().await.unwrap();
        assert_eq!(mock.permissions.settings_opened(), 1);
    }

    #[tokio::test]
    async fn test_connect_stops_discovery_first() {
        let mock = MockPlatform::new();
        let coordinator = started(&mock).await;
        coordinator.request_scan().await.unwrap();
        assert!(coordinator.snapshot().is_scanning());

        coordinator.request_connect("AA:BB").await.unwrap();
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.discovery_state, DiscoveryState::Idle);
        assert_eq!(snapshot.connection_state, ConnectionState::Open);
        assert_eq!(mock.discovery.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_adapter_off_tears_everything_down() {
        let mock = MockPlatform::new();
        let coordinator = started(&mock).await;
        let mut rx = coordinator.subscribe();

        coordinator.request_connect("AA:BB").await.unwrap();
        let peer = mock.connector.peer("AA:BB").unwrap();

        mock.adapter.set_state(AdapterState::Off);
        let snapshot = wait_for_snapshot(&mut rx, |s| {
            s.adapter_state == AdapterState::Off && s.connection_state == ConnectionState::Idle
        })
        .await
        .unwrap();
        assert_eq!(snapshot.connected_address, None);
        assert_eq!(snapshot.last_disconnect, Some(DisconnectReason::AdapterOff));
        assert!(peer.is_shut_down());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let mock = MockPlatform::new();
        let coordinator = started(&mock).await;
        coordinator.request_connect("AA:BB").await.unwrap();
        coordinator.request_scan().await.unwrap();

        coordinator.shutdown().await;
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.is_scanning());
        assert_eq!(snapshot.connection_state, ConnectionState::Idle);
    }
}
