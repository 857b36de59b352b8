//! Adapter state tracker
//!
//! Follows the radio's power state. Transitions are delivered to a single
//! subscriber callback strictly in the order the stack reported them, and the
//! callback is awaited before the next transition is read, so at most one
//! delivery is in flight.
//!
//! The tracker also keeps a `watch` copy of the latest delivered state. It is
//! updated *after* the callback returns, which means anything waiting through
//! [`AdapterStateTracker::wait_for_state`] observes a transition only once the
//! subscriber has finished reacting to it.

use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::platform::RadioAdapter;
use crate::types::AdapterState;

/// Tracks radio power state
pub struct AdapterStateTracker {
    adapter: Arc<dyn RadioAdapter>,
    state_tx: Arc<watch::Sender<AdapterState>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterStateTracker {
    pub(crate) fn new(adapter: Arc<dyn RadioAdapter>) -> Self {
        let (state_tx, _) = watch::channel(AdapterState::Unknown);
        Self {
            adapter,
            state_tx: Arc::new(state_tx),
            subscription: Mutex::new(None),
        }
    }

    /// Query the radio
    ///
    /// Best effort: a failed query yields `Unknown` instead of an error.
    pub async fn current_state(&self) -> AdapterState {
        match self.adapter.current_power_state().await {
            Ok(state) => {
                debug!(%state, "Adapter state queried");
                self.state_tx.send_replace(state);
                state
            }
            Err(e) => {
                warn!(error = %e, "Adapter state query failed");
                AdapterState::Unknown
            }
        }
    }

    /// Latest state seen by the tracker, without querying the radio
    pub fn latest(&self) -> AdapterState {
        *self.state_tx.borrow()
    }

    /// Deliver every power transition to `on_change`
    ///
    /// Replaces any previous subscription.
    pub async fn subscribe<F, Fut>(&self, mut on_change: F) -> Result<()>
    where
        F: FnMut(AdapterState) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut states = self.adapter.subscribe_power_state().await?;
        let state_tx = self.state_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(state) = states.next().await {
                info!(%state, "Adapter state changed");
                on_change(state).await;
                state_tx.send_replace(state);
            }
            debug!("Adapter state stream ended");
        });

        if let Some(previous) = self.subscription.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop delivering transitions
    pub fn unsubscribe(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
            debug!("Adapter state subscription dropped");
        }
    }

    /// Wait until the state satisfies `predicate`, for at most `timeout`
    ///
    /// Returns the matching state, or `None` on timeout.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&AdapterState) -> bool,
        timeout: Duration,
    ) -> Option<AdapterState> {
        let mut rx = self.state_tx.subscribe();
        let state = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(?timeout, "Timed out waiting for adapter state");
                None
            }
        };
        state
    }
}

impl Drop for AdapterStateTracker {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockAdapter;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_query_failure_is_unknown() {
        let adapter = Arc::new(MockAdapter::new(AdapterState::On));
        let tracker = AdapterStateTracker::new(adapter.clone());
        assert_eq!(tracker.current_state().await, AdapterState::On);

        adapter.fail_queries(true);
        assert_eq!(tracker.current_state().await, AdapterState::Unknown);
    }

    #[tokio::test]
    async fn test_transitions_delivered_in_order() {
        let adapter = Arc::new(MockAdapter::new(AdapterState::On));
        let tracker = AdapterStateTracker::new(adapter.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        tracker
            .subscribe(move |state| {
                let tx = tx.clone();
                async move {
                    // A slow subscriber must not see states out of order
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let _ = tx.send(state);
                }
            })
            .await
            .unwrap();

        adapter.set_state(AdapterState::TurningOff);
        adapter.set_state(AdapterState::Off);
        adapter.set_state(AdapterState::TurningOn);
        adapter.set_state(AdapterState::On);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                AdapterState::TurningOff,
                AdapterState::Off,
                AdapterState::TurningOn,
                AdapterState::On
            ]
        );
    }

    #[tokio::test]
    async fn test_wait_for_state() {
        let adapter = Arc::new(MockAdapter::new(AdapterState::TurningOn));
        let tracker = Arc::new(AdapterStateTracker::new(adapter.clone()));
        tracker.current_state().await;
        tracker.subscribe(|_| async {}).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_for_state(|s| s.is_on(), Duration::from_secs(2))
                    .await
            })
        };
        adapter.set_state(AdapterState::On);
        assert_eq!(waiter.await.unwrap(), Some(AdapterState::On));

        let timed_out = tracker
            .wait_for_state(|s| *s == AdapterState::Off, Duration::from_millis(20))
            .await;
        assert_eq!(timed_out, None);
    }
}
