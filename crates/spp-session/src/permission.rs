//! Permission gate
//!
//! Resolves the OS capabilities a radio operation needs. Statuses are read
//! fresh from the provider on every call so that a change made in system
//! settings is picked up on the next intent; the copy kept in the snapshot is
//! for display only.
//!
//! Capabilities that are `PermanentlyDenied` are never re-prompted. The
//! outcome says so, and the caller is expected to send the user to system
//! settings instead of looping on the prompt.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::event::SessionEvent;
use crate::platform::PermissionProvider;
use crate::snapshot::SessionStore;
use crate::types::{Capability, PermissionStatus};

/// Result of one request cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionOutcome {
    /// Status of every requested capability after the cycle
    pub statuses: BTreeMap<Capability, PermissionStatus>,
    /// Whether an OS prompt was shown
    pub prompted: bool,
}

impl PermissionOutcome {
    /// Every requested capability is granted
    pub fn all_granted(&self) -> bool {
        self.statuses.values().all(PermissionStatus::is_granted)
    }

    /// Capabilities that are not granted
    pub fn denied(&self) -> BTreeSet<Capability> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.is_granted())
            .map(|(capability, _)| *capability)
            .collect()
    }

    /// Capabilities that only system settings can grant
    pub fn permanently_denied(&self) -> BTreeSet<Capability> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == PermissionStatus::PermanentlyDenied)
            .map(|(capability, _)| *capability)
            .collect()
    }

    /// Convert a denial into [`SessionError::PermissionDenied`]
    pub fn into_result(self) -> Result<Self> {
        if self.all_granted() {
            return Ok(self);
        }
        Err(SessionError::PermissionDenied {
            denied: self.denied().into_iter().collect(),
            permanent: !self.permanently_denied().is_empty(),
        })
    }
}

/// Resolves and requests OS capabilities
pub struct PermissionGate {
    provider: Arc<dyn PermissionProvider>,
    store: Arc<SessionStore>,
}

impl PermissionGate {
    pub(crate) fn new(provider: Arc<dyn PermissionProvider>, store: Arc<SessionStore>) -> Self {
        Self { provider, store }
    }

    /// Probe every capability without prompting
    pub async fn check_all(&self) -> BTreeMap<Capability, PermissionStatus> {
        self.check(&Capability::ALL).await
    }

    /// Probe the given capabilities without prompting
    ///
    /// A failed probe reports `NotDetermined` for that capability.
    pub async fn check(&self, capabilities: &[Capability]) -> BTreeMap<Capability, PermissionStatus> {
        let mut statuses = BTreeMap::new();
        for capability in capabilities {
            let status = match self.provider.query_status(*capability).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(%capability, error = %e, "Permission probe failed");
                    PermissionStatus::NotDetermined
                }
            };
            statuses.insert(*capability, status);
        }
        debug!(?statuses, "Permission probe");
        self.publish(&statuses);
        statuses
    }

    /// Request every capability a scan-then-connect session needs
    pub async fn request_all(&self) -> Result<PermissionOutcome> {
        self.request(&Capability::ALL).await
    }

    /// Request the given capabilities in one batched prompt
    ///
    /// No prompt is shown when everything is already granted, and
    /// permanently denied capabilities are left out of the prompt.
    pub async fn request(&self, capabilities: &[Capability]) -> Result<PermissionOutcome> {
        let mut statuses = self.check(capabilities).await;

        let to_prompt: Vec<Capability> = statuses
            .iter()
            .filter(|(_, status)| status.can_prompt())
            .map(|(capability, _)| *capability)
            .collect();

        let prompted = !to_prompt.is_empty();
        if prompted {
            info!(capabilities = ?to_prompt, "Requesting permissions");
            let answers = self.provider.request_all(&to_prompt).await?;
            for capability in &to_prompt {
                if let Some(status) = answers.get(capability) {
                    statuses.insert(*capability, *status);
                }
            }
            self.publish(&statuses);
        }

        let outcome = PermissionOutcome { statuses, prompted };
        if !outcome.all_granted() {
            warn!(
                denied = ?outcome.denied(),
                permanent = ?outcome.permanently_denied(),
                "Permissions not granted"
            );
        }
        self.store.emit(SessionEvent::PermissionsResolved {
            statuses: outcome.statuses.clone(),
        });
        Ok(outcome)
    }

    /// Send the user to the system settings page
    pub async fn open_system_settings(&self) -> Result<()> {
        info!("Opening system settings");
        self.provider.open_system_settings().await
    }

    fn publish(&self, statuses: &BTreeMap<Capability, PermissionStatus>) {
        self.store.update(|t| {
            for (capability, status) in statuses {
                t.snapshot.capabilities.insert(*capability, *status);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::UnrestrictedPermissions;
    use crate::test_utils::MockPermissions;

    fn gate(provider: Arc<dyn PermissionProvider>) -> (PermissionGate, Arc<SessionStore>) {
        let store = SessionStore::new(16);
        (PermissionGate::new(provider, store.clone()), store)
    }

    #[tokio::test]
    async fn test_no_permission_model_grants_without_prompt() {
        let (gate, _) = gate(Arc::new(UnrestrictedPermissions));
        let outcome = gate.request_all().await.unwrap();
        assert!(outcome.all_granted());
        assert!(!outcome.prompted);
        assert!(outcome.denied().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_only_when_needed() {
        let provider = Arc::new(MockPermissions::new());
        provider.set_answer(Capability::ScanRadio, PermissionStatus::Granted);
        provider.set_answer(Capability::ConnectRadio, PermissionStatus::Granted);
        provider.set_answer(Capability::Location, PermissionStatus::Granted);
        let (gate, store) = gate(provider.clone());

        let outcome = gate.request_all().await.unwrap();
        assert!(outcome.all_granted());
        assert!(outcome.prompted);
        assert_eq!(provider.prompt_count(), 1);

        // Second cycle: already granted, no prompt
        let outcome = gate.request_all().await.unwrap();
        assert!(!outcome.prompted);
        assert_eq!(provider.prompt_count(), 1);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.capabilities.len(), 3);
        assert!(snapshot.capabilities.values().all(PermissionStatus::is_granted));
    }

    #[tokio::test]
    async fn test_denied_vs_permanently_denied() {
        let provider = Arc::new(MockPermissions::new());
        provider.set_answer(Capability::ScanRadio, PermissionStatus::Granted);
        provider.set_answer(Capability::ConnectRadio, PermissionStatus::Denied);
        provider.set_status(Capability::Location, PermissionStatus::PermanentlyDenied);
        let (gate, _) = gate(provider.clone());

        let outcome = gate.request_all().await.unwrap();
        assert!(!outcome.all_granted());
        assert_eq!(
            outcome.denied(),
            BTreeSet::from([Capability::ConnectRadio, Capability::Location])
        );
        assert_eq!(
            outcome.permanently_denied(),
            BTreeSet::from([Capability::Location])
        );
        // Location was never part of the prompt
        assert!(!provider.prompted_for(Capability::Location));

        match outcome.into_result() {
            Err(SessionError::PermissionDenied { denied, permanent }) => {
                assert_eq!(denied.len(), 2);
                assert!(permanent);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_check_never_prompts() {
        let provider = Arc::new(MockPermissions::new());
        let (gate, _) = gate(provider.clone());
        let statuses = gate.check_all().await;
        assert!(statuses
            .values()
            .all(|s| *s == PermissionStatus::NotDetermined));
        assert_eq!(provider.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_open_settings_forwarded() {
        let provider = Arc::new(MockPermissions::new());
        let (gate, _) = gate(provider.clone());
        gate.open_system_settings().await.unwrap();
        assert_eq!(provider.settings_opened(), 1);
    }
}
