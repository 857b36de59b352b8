//! Discovery session
//!
//! Runs one inquiry at a time and feeds its sightings into the device
//! registry held in the session snapshot.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐   start_scan   ┌──────────────────────┐
//! │  DiscoverySession  │ ─────────────► │ DiscoveryTransport   │
//! └─────────┬──────────┘                └──────────┬───────────┘
//!           │ spawn                                 │ SightingStream
//!           ▼                                       ▼
//!     ┌───────────┐  insert (epoch checked)  ┌──────────────┐
//!     │ pump task │ ───────────────────────► │ SessionStore │
//!     └───────────┘                          └──────────────┘
//! ```
//!
//! Every start and stop bumps the scan epoch under the store lock. The pump
//! only writes while the epoch it was started with is current, so once
//! `stop` has returned no sighting from the old inquiry can reach the
//! registry, even if the transport keeps delivering.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SessionError};
use crate::event::{ScanOutcome, SessionEvent};
use crate::permission::PermissionGate;
use crate::platform::{DiscoveryTransport, SightingStream};
use crate::snapshot::{DiscoveryState, SessionStore, Tracked};
use crate::types::{Capability, PermissionStatus};

/// One inquiry at a time
pub struct DiscoverySession {
    transport: Arc<dyn DiscoveryTransport>,
    gate: Arc<PermissionGate>,
    store: Arc<SessionStore>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoverySession {
    pub(crate) fn new(
        transport: Arc<dyn DiscoveryTransport>,
        gate: Arc<PermissionGate>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            transport,
            gate,
            store,
            pump: Mutex::new(None),
        }
    }

    /// Start an inquiry
    ///
    /// Requires every capability to be granted already (no prompt is shown
    /// here) and the adapter to be on. Clears the registry before the first
    /// sighting is accepted.
    pub async fn start(&self) -> Result<()> {
        if self.store.read(|t| t.snapshot.is_scanning()) {
            return Err(SessionError::AlreadyScanning);
        }

        let statuses = self.gate.check(&Capability::ALL).await;
        let denied: Vec<Capability> = statuses
            .iter()
            .filter(|(_, status)| !status.is_granted())
            .map(|(capability, _)| *capability)
            .collect();
        if !denied.is_empty() {
            let permanent = denied
                .iter()
                .any(|c| statuses.get(c) == Some(&PermissionStatus::PermanentlyDenied));
            return Err(SessionError::PermissionDenied { denied, permanent });
        }

        let epoch = self.store.update(|t| {
            if t.snapshot.is_scanning() {
                return Err(SessionError::AlreadyScanning);
            }
            if !t.snapshot.adapter_state.is_on() {
                return Err(SessionError::AdapterNotOn(t.snapshot.adapter_state));
            }
            t.scan_epoch += 1;
            t.snapshot.discovery_state = DiscoveryState::Scanning;
            t.snapshot.devices.clear();
            t.snapshot.last_scan_outcome = None;
            Ok(t.scan_epoch)
        })?;

        let sightings = match self.transport.start_scan().await {
            Ok(sightings) => sightings,
            Err(e) => {
                warn!(error = %e, "Discovery failed to start");
                let outcome = ScanOutcome::Failed {
                    reason: e.to_string(),
                };
                if Self::finish(&self.store, epoch, outcome.clone()) {
                    self.store.emit(SessionEvent::ScanFinished(outcome));
                }
                return Err(match e {
                    SessionError::DiscoveryFailed(_) => e,
                    other => SessionError::DiscoveryFailed(other.to_string()),
                });
            }
        };

        info!(epoch, "Discovery started");
        self.store.emit(SessionEvent::ScanStarted);

        let handle = tokio::spawn(Self::pump(self.store.clone(), sightings, epoch));
        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }

        // A stop that raced the transport call already moved the epoch on
        if self.store.read(|t| t.scan_epoch != epoch) {
            debug!(epoch, "Discovery stopped while starting");
            if let Some(handle) = self.pump.lock().take() {
                handle.abort();
            }
            if let Err(e) = self.transport.cancel_scan().await {
                warn!(error = %e, "Failed to cancel discovery");
            }
        }
        Ok(())
    }

    /// Stop the running inquiry
    ///
    /// No-op when idle. After this returns the registry is stable.
    pub async fn stop(&self) {
        let halted = self.store.update(Self::halt);
        self.release(halted).await;
    }

    /// Whether an inquiry is running
    pub fn is_scanning(&self) -> bool {
        self.store.read(|t| t.snapshot.is_scanning())
    }

    /// State half of a stop; runs under the store lock
    pub(crate) fn halt(t: &mut Tracked) -> bool {
        if !t.snapshot.is_scanning() {
            return false;
        }
        t.scan_epoch += 1;
        t.snapshot.discovery_state = DiscoveryState::Idle;
        t.snapshot.last_scan_outcome = Some(ScanOutcome::Cancelled);
        true
    }

    /// Resource half of a stop: end the pump, then the inquiry
    ///
    /// Does nothing unless `halted`; a running pump belongs to the scan that
    /// is still live.
    pub(crate) async fn release(&self, halted: bool) {
        if !halted {
            trace!("No scan to release");
            return;
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            let _ = pump.await;
        }
        if let Err(e) = self.transport.cancel_scan().await {
            warn!(error = %e, "Failed to cancel discovery");
        }
        info!("Discovery stopped");
        self.store
            .emit(SessionEvent::ScanFinished(ScanOutcome::Cancelled));
    }

    async fn pump(store: Arc<SessionStore>, mut sightings: SightingStream, epoch: u64) {
        let outcome = loop {
            match sightings.next().await {
                Some(Ok(sighting)) => {
                    let accepted = store.update(|t| {
                        if t.scan_epoch != epoch {
                            return None;
                        }
                        Some(t.snapshot.devices.insert(sighting).ok().cloned())
                    });
                    match accepted {
                        None => return,
                        Some(Some(device)) => {
                            debug!(address = %device.address, name = device.label(), "Device discovered");
                            store.emit(SessionEvent::DeviceDiscovered(device));
                        }
                        Some(None) => trace!("Sighting dropped"),
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Discovery failed");
                    break ScanOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
                None => {
                    let devices = store.read(|t| t.snapshot.devices.len());
                    break ScanOutcome::Completed { devices };
                }
            }
        };

        if Self::finish(&store, epoch, outcome.clone()) {
            info!(?outcome, "Discovery finished");
            store.emit(SessionEvent::ScanFinished(outcome));
        }
    }

    /// Move back to Idle if `epoch` is still current
    fn finish(store: &SessionStore, epoch: u64, outcome: ScanOutcome) -> bool {
        store.update(|t| {
            if t.scan_epoch != epoch {
                return false;
            }
            t.scan_epoch += 1;
            t.snapshot.discovery_state = DiscoveryState::Idle;
            t.snapshot.last_scan_outcome = Some(outcome);
            true
        })
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{wait_for_snapshot, MockDiscovery, MockPermissions};
    use crate::types::AdapterState;

    struct Fixture {
        session: DiscoverySession,
        transport: Arc<MockDiscovery>,
        store: Arc<SessionStore>,
    }

    fn fixture(permissions: MockPermissions) -> Fixture {
        let store = SessionStore::new(64);
        store.update(|t| t.snapshot.adapter_state = AdapterState::On);
        let transport = Arc::new(MockDiscovery::new());
        let gate = Arc::new(PermissionGate::new(Arc::new(permissions), store.clone()));
        Fixture {
            session: DiscoverySession::new(transport.clone(), gate, store.clone()),
            transport,
            store,
        }
    }

    #[tokio::test]
    async fn test_sightings_deduplicated_in_order() {
        let f = fixture(MockPermissions::granted());
        let mut rx = f.store.subscribe();
        f.session.start().await.unwrap();

        f.transport.push("AA:AA", Some("First"));
        f.transport.push("BB:BB", None);
        f.transport.push("AA:AA", Some("Renamed"));
        f.transport.push("CC:CC", Some("Second"));
        f.transport.finish();

        let done = wait_for_snapshot(&mut rx, |s| !s.is_scanning()).await.unwrap();
        let names: Vec<_> = done.devices.iter().map(|d| d.label().to_string()).collect();
        assert_eq!(names, vec!["First", "Second"]);
        assert_eq!(
            done.last_scan_outcome,
            Some(ScanOutcome::Completed { devices: 2 })
        );
    }

    #[tokio::test]
    async fn test_start_requires_permissions() {
        let permissions = MockPermissions::granted();
        permissions.set_status(Capability::Location, PermissionStatus::Denied);
        let f = fixture(permissions);

        match f.session.start().await {
            Err(SessionError::PermissionDenied { denied, permanent }) => {
                assert_eq!(denied, vec![Capability::Location]);
                assert!(!permanent);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
        assert_eq!(f.transport.start_count(), 0);
        assert!(!f.session.is_scanning());
    }

    #[tokio::test]
    async fn test_start_requires_adapter_on() {
        let f = fixture(MockPermissions::granted());
        f.store
            .update(|t| t.snapshot.adapter_state = AdapterState::Off);
        assert!(matches!(
            f.session.start().await,
            Err(SessionError::AdapterNotOn(AdapterState::Off))
        ));
        assert_eq!(f.transport.start_count(), 0);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let f = fixture(MockPermissions::granted());
        f.session.start().await.unwrap();
        assert!(matches!(
            f.session.start().await,
            Err(SessionError::AlreadyScanning)
        ));
        assert_eq!(f.transport.start_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_freezes_registry() {
        let f = fixture(MockPermissions::granted());
        let mut rx = f.store.subscribe();
        f.session.start().await.unwrap();
        f.transport.push("AA:AA", Some("Kept"));
        wait_for_snapshot(&mut rx, |s| s.devices.len() == 1)
            .await
            .unwrap();

        f.session.stop().await;
        assert!(!f.session.is_scanning());
        assert_eq!(f.transport.cancel_count(), 1);

        // Late sighting from the cancelled inquiry
        f.transport.push("BB:BB", Some("Late"));
        tokio::task::yield_now().await;

        let snapshot = f.store.snapshot();
        assert_eq!(snapshot.devices.len(), 1);
        assert_eq!(snapshot.last_scan_outcome, Some(ScanOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let f = fixture(MockPermissions::granted());
        f.session.stop().await;
        assert_eq!(f.transport.cancel_count(), 0);
        assert_eq!(f.store.snapshot().last_scan_outcome, None);
    }

    #[tokio::test]
    async fn test_transport_failure_returns_to_idle() {
        let f = fixture(MockPermissions::granted());
        let mut rx = f.store.subscribe();
        f.session.start().await.unwrap();
        f.transport.fail("inquiry aborted");

        let done = wait_for_snapshot(&mut rx, |s| !s.is_scanning()).await.unwrap();
        assert!(matches!(
            done.last_scan_outcome,
            Some(ScanOutcome::Failed { .. })
        ));

        f.transport.fail_next_start("radio busy");
        assert!(matches!(
            f.session.start().await,
            Err(SessionError::DiscoveryFailed(_))
        ));
        assert!(!f.session.is_scanning());
    }

    #[tokio::test]
    async fn test_restart_clears_registry() {
        let f = fixture(MockPermissions::granted());
        let mut rx = f.store.subscribe();
        f.session.start().await.unwrap();
        f.transport.push("AA:AA", Some("Old"));
        f.transport.finish();
        wait_for_snapshot(&mut rx, |s| !s.is_scanning()).await.unwrap();
        assert_eq!(f.store.snapshot().devices.len(), 1);

        f.session.start().await.unwrap();
        assert!(f.store.snapshot().devices.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_halt_keeps_scan_running() {
        let f = fixture(MockPermissions::granted());
        let mut rx = f.store.subscribe();
        f.session.start().await.unwrap();
        f.transport.push("AA:AA", Some("First"));
        wait_for_snapshot(&mut rx, |s| s.devices.len() == 1).await.unwrap();

        f.session.release(false).await;
        assert!(f.session.is_scanning());
        assert_eq!(f.transport.cancel_count(), 0);

        assert!(f.transport.push("BB:BB", Some("Second")));
        f.transport.finish();
        let done = wait_for_snapshot(&mut rx, |s| !s.is_scanning()).await.unwrap();
        assert_eq!(done.devices.len(), 2);
        assert_eq!(
            done.last_scan_outcome,
            Some(ScanOutcome::Completed { devices: 2 })
        );
    }
}
