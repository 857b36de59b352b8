//! Scriptable platform for tests and the simulated console backend
//!
//! Every collaborator trait has a mock here that records what the session
//! asked of it and lets the test drive the other side: flip the radio, feed
//! sightings, accept or refuse connects, and push bytes from a fake peer.
//!
//! # Example
//!
//! ```rust,ignore
//! use spp_session::test_utils::MockPlatform;
//! use spp_session::{SessionConfig, SessionCoordinator};
//!
//! let mock = MockPlatform::new();
//! let coordinator = SessionCoordinator::new(mock.platform(), SessionConfig::default())?;
//! coordinator.start().await?;
//!
//! coordinator.request_scan().await?;
//! mock.discovery.push("00:11:22:33:44:55", Some("HC-05"));
//! mock.discovery.finish();
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::platform::{
    ConnectionTransport, DiscoveryTransport, Platform, PermissionProvider, PowerStateStream,
    RadioAdapter, SerialLink, SightingStream,
};
use crate::snapshot::SessionSnapshot;
use crate::types::{AdapterState, Capability, PermissionStatus, Sighting};

// ===== Permissions =====

/// Permission model with per-capability status and scripted prompt answers
#[derive(Debug)]
pub struct MockPermissions {
    statuses: Mutex<HashMap<Capability, PermissionStatus>>,
    answers: Mutex<HashMap<Capability, PermissionStatus>>,
    prompts: Mutex<Vec<Vec<Capability>>>,
    settings_opened: AtomicUsize,
}

impl MockPermissions {
    /// Nothing decided yet; prompts grant unless scripted otherwise
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            answers: Mutex::new(HashMap::new()),
            prompts: Mutex::new(Vec::new()),
            settings_opened: AtomicUsize::new(0),
        }
    }

    /// Everything already granted
    pub fn granted() -> Self {
        let mock = Self::new();
        for capability in Capability::ALL {
            mock.set_status(capability, PermissionStatus::Granted);
        }
        mock
    }

    /// Set the current status
    pub fn set_status(&self, capability: Capability, status: PermissionStatus) {
        self.statuses.lock().insert(capability, status);
    }

    /// Set what the user answers when prompted
    pub fn set_answer(&self, capability: Capability, status: PermissionStatus) {
        self.answers.lock().insert(capability, status);
    }

    /// Number of prompts shown
    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Whether any prompt included `capability`
    pub fn prompted_for(&self, capability: Capability) -> bool {
        self.prompts
            .lock()
            .iter()
            .any(|batch| batch.contains(&capability))
    }

    /// Number of times system settings were opened
    pub fn settings_opened(&self) -> usize {
        self.settings_opened.load(Ordering::SeqCst)
    }
}

impl Default for MockPermissions {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PermissionProvider for MockPermissions {
    async fn query_status(&self, capability: Capability) -> Result<PermissionStatus> {
        Ok(self
            .statuses
            .lock()
            .get(&capability)
            .copied()
            .unwrap_or_default())
    }

    async fn request_all(
        &self,
        capabilities: &[Capability],
    ) -> Result<HashMap<Capability, PermissionStatus>> {
        self.prompts.lock().push(capabilities.to_vec());

        let answers = self.answers.lock();
        let mut statuses = self.statuses.lock();
        let mut result = HashMap::new();
        for capability in capabilities {
            let answer = answers
                .get(capability)
                .copied()
                .unwrap_or(PermissionStatus::Granted);
            statuses.insert(*capability, answer);
            result.insert(*capability, answer);
        }
        Ok(result)
    }

    async fn open_system_settings(&self) -> Result<()> {
        self.settings_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ===== Adapter =====

/// Radio whose power state the test flips by hand
#[derive(Debug)]
pub struct MockAdapter {
    state: Mutex<AdapterState>,
    subscribers: Mutex<Vec<UnboundedSender<AdapterState>>>,
    fail_queries: AtomicBool,
}

impl MockAdapter {
    /// Radio starting in `initial`
    pub fn new(initial: AdapterState) -> Self {
        Self {
            state: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
            fail_queries: AtomicBool::new(false),
        }
    }

    /// Change power state and notify subscribers
    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(state).is_ok());
    }

    /// Make `current_power_state` fail
    pub fn fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Current power state
    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }
}

#[async_trait]
impl RadioAdapter for MockAdapter {
    async fn current_power_state(&self) -> Result<AdapterState> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(SessionError::Platform("adapter query failed".into()));
        }
        Ok(*self.state.lock())
    }

    async fn subscribe_power_state(&self) -> Result<PowerStateStream> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        Ok(rx.boxed())
    }
}

// ===== Discovery =====

/// Inquiry whose sightings the test feeds one by one
#[derive(Debug, Default)]
pub struct MockDiscovery {
    current: Mutex<Option<UnboundedSender<Result<Sighting>>>>,
    script: Mutex<Option<(Vec<Sighting>, Duration)>>,
    fail_next_start: Mutex<Option<String>>,
    starts: AtomicUsize,
    cancels: AtomicUsize,
}

impl MockDiscovery {
    /// Idle inquiry
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed every scan the same sightings, one per `interval`, then complete it
    pub fn script(&self, sightings: Vec<Sighting>, interval: Duration) {
        *self.script.lock() = Some((sightings, interval));
    }

    /// Make the next `start_scan` fail
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        *self.fail_next_start.lock() = Some(reason.into());
    }

    /// Report a sighting on the running scan; false if none is running
    pub fn push(&self, address: &str, name: Option<&str>) -> bool {
        match self.current.lock().as_ref() {
            Some(tx) => tx.unbounded_send(Ok(Sighting::new(address, name))).is_ok(),
            None => false,
        }
    }

    /// End the running scan normally
    pub fn finish(&self) {
        self.current.lock().take();
    }

    /// End the running scan with an error
    pub fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.unbounded_send(Err(SessionError::DiscoveryFailed(reason.into())));
        }
    }

    /// Whether a scan is open and its consumer is still listening
    pub fn is_active(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of `start_scan` calls
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `cancel_scan` calls
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryTransport for MockDiscovery {
    async fn start_scan(&self) -> Result<SightingStream> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.fail_next_start.lock().take() {
            return Err(SessionError::DiscoveryFailed(reason));
        }

        let (tx, rx) = unbounded();
        let script = self.script.lock().clone();
        match script {
            Some((sightings, interval)) => {
                tokio::spawn(async move {
                    for sighting in sightings {
                        tokio::time::sleep(interval).await;
                        if tx.unbounded_send(Ok(sighting)).is_err() {
                            return;
                        }
                    }
                });
            }
            None => {
                *self.current.lock() = Some(tx);
            }
        }
        Ok(rx.boxed())
    }

    async fn cancel_scan(&self) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.current.lock().take();
        Ok(())
    }
}

// ===== Connection =====

/// How the mock connector answers a connect attempt
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// Open a link; the test drives the peer
    Accept,
    /// Open a link whose peer echoes every write back
    Echo,
    /// Fail with this error
    Refuse(io::ErrorKind, String),
    /// Never complete
    Hang,
}

/// RFCOMM connector with per-address behavior
#[derive(Debug)]
pub struct MockConnector {
    default: Mutex<ConnectBehavior>,
    behaviors: Mutex<HashMap<String, ConnectBehavior>>,
    peers: Mutex<HashMap<String, MockPeer>>,
    attempts: Mutex<Vec<String>>,
    attempt_tx: watch::Sender<usize>,
}

impl MockConnector {
    /// Connector that accepts every address
    pub fn new() -> Self {
        Self::with_default(ConnectBehavior::Accept)
    }

    /// Connector answering unknown addresses with `behavior`
    pub fn with_default(behavior: ConnectBehavior) -> Self {
        let (attempt_tx, _) = watch::channel(0);
        Self {
            default: Mutex::new(behavior),
            behaviors: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            attempt_tx,
        }
    }

    /// Answer attempts to `address` with `behavior`
    pub fn set_behavior(&self, address: &str, behavior: ConnectBehavior) {
        self.behaviors.lock().insert(address.to_string(), behavior);
    }

    /// Peer of the latest successful connect to `address`
    pub fn peer(&self, address: &str) -> Option<MockPeer> {
        self.peers.lock().get(address).cloned()
    }

    /// Every address a connect was attempted to, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Wait until at least `count` attempts were made
    pub async fn wait_for_attempts(&self, count: usize) {
        let mut rx = self.attempt_tx.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionTransport for MockConnector {
    async fn connect_by_address(&self, address: &str) -> io::Result<SerialLink> {
        let behavior = self
            .behaviors
            .lock()
            .get(address)
            .cloned()
            .unwrap_or_else(|| self.default.lock().clone());
        let count = {
            let mut attempts = self.attempts.lock();
            attempts.push(address.to_string());
            attempts.len()
        };
        self.attempt_tx.send_replace(count);
        debug!(address, ?behavior, "Mock connect attempt");

        let echo = match behavior {
            ConnectBehavior::Accept => false,
            ConnectBehavior::Echo => true,
            ConnectBehavior::Refuse(kind, message) => return Err(io::Error::new(kind, message)),
            ConnectBehavior::Hang => futures::future::pending().await,
        };

        let (peer, link) = MockPeer::open(echo);
        self.peers.lock().insert(address.to_string(), peer);
        Ok(link)
    }
}

#[derive(Debug, Default)]
struct PeerState {
    inbound: Mutex<Option<UnboundedSender<io::Result<Bytes>>>>,
    written: Mutex<Vec<u8>>,
    shut_down: AtomicBool,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
}

/// Far end of a mock serial link
#[derive(Debug, Clone)]
pub struct MockPeer {
    state: Arc<PeerState>,
}

impl MockPeer {
    fn open(echo: bool) -> (Self, SerialLink) {
        let (tx, rx) = unbounded();
        let state = Arc::new(PeerState::default());
        *state.inbound.lock() = Some(tx);
        let peer = Self { state };
        let sink = MockSink {
            peer: peer.clone(),
            echo,
        };
        (peer.clone(), SerialLink::new(rx.boxed(), Box::new(sink)))
    }

    /// Send bytes to the session; false once the input side is gone
    pub fn send(&self, bytes: impl AsRef<[u8]>) -> bool {
        match self.state.inbound.lock().as_ref() {
            Some(tx) => tx
                .unbounded_send(Ok(Bytes::copy_from_slice(bytes.as_ref())))
                .is_ok(),
            None => false,
        }
    }

    /// Close the peer's side; the session reads end of stream
    pub fn hang_up(&self) {
        self.state.inbound.lock().take();
    }

    /// Break the input stream with an error
    pub fn break_stream(&self, kind: io::ErrorKind, message: &str) {
        if let Some(tx) = self.state.inbound.lock().take() {
            let _ = tx.unbounded_send(Err(io::Error::new(kind, message.to_string())));
        }
    }

    /// Whether the session has dropped its input subscription
    pub fn is_input_released(&self) -> bool {
        self.state
            .inbound
            .lock()
            .as_ref()
            .map_or(true, |tx| tx.is_closed())
    }

    /// Everything the session wrote
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().clone()
    }

    /// Everything the session wrote, as text
    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    /// Whether the session shut the output half down
    pub fn is_shut_down(&self) -> bool {
        self.state.shut_down.load(Ordering::SeqCst)
    }

    /// Make every write fail
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every write block until the session gives up on it
    pub fn stall_writes(&self, stall: bool) {
        self.state.stall_writes.store(stall, Ordering::SeqCst);
    }
}

struct MockSink {
    peer: MockPeer,
    echo: bool,
}

impl AsyncWrite for MockSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let state = &self.peer.state;
        if state.fail_writes.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        if state.stall_writes.load(Ordering::SeqCst) {
            return Poll::Pending;
        }
        if state.shut_down.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "mock socket closed",
            )));
        }
        state.written.lock().extend_from_slice(buf);
        if self.echo {
            self.peer.send(buf);
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.peer.state.shut_down.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

// ===== Platform =====

/// One mock of each collaborator
#[derive(Clone)]
pub struct MockPlatform {
    /// Permission model
    pub permissions: Arc<MockPermissions>,
    /// Radio power
    pub adapter: Arc<MockAdapter>,
    /// Inquiry
    pub discovery: Arc<MockDiscovery>,
    /// RFCOMM connector
    pub connector: Arc<MockConnector>,
}

impl MockPlatform {
    /// Permissions granted, radio on, every connect accepted
    pub fn new() -> Self {
        Self {
            permissions: Arc::new(MockPermissions::granted()),
            adapter: Arc::new(MockAdapter::new(AdapterState::On)),
            discovery: Arc::new(MockDiscovery::new()),
            connector: Arc::new(MockConnector::new()),
        }
    }

    /// Neighbourhood of echoing serial devices for interactive use
    pub fn simulated() -> Self {
        let mock = Self {
            connector: Arc::new(MockConnector::with_default(ConnectBehavior::Echo)),
            ..Self::new()
        };
        mock.discovery.script(
            vec![
                Sighting::new("98:D3:31:F5:12:34", Some("HC-05")),
                Sighting::new("00:21:13:00:A1:B2", Some("HC-06")),
                Sighting::new("5C:F3:70:8E:44:01", None),
                Sighting::new("00:19:5D:EE:22:10", Some("OBDII")),
                Sighting::new("98:D3:31:F5:12:34", Some("HC-05")),
            ],
            Duration::from_millis(400),
        );
        mock.connector.set_behavior(
            "00:19:5D:EE:22:10",
            ConnectBehavior::Refuse(
                io::ErrorKind::ConnectionRefused,
                "read failed, socket might closed or timeout".into(),
            ),
        );
        mock
    }

    /// Bundle the mocks as trait objects
    pub fn platform(&self) -> Platform {
        Platform::new(
            self.permissions.clone(),
            self.adapter.clone(),
            self.discovery.clone(),
            self.connector.clone(),
        )
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPlatform")
            .field("adapter", &self.adapter.state())
            .finish_non_exhaustive()
    }
}

/// Wait until the snapshot satisfies `predicate`, for at most two seconds
pub async fn wait_for_snapshot(
    rx: &mut watch::Receiver<SessionSnapshot>,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> Option<SessionSnapshot> {
    match tokio::time::timeout(Duration::from_secs(2), rx.wait_for(predicate)).await {
        Ok(Ok(snapshot)) => Some(snapshot.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_mock_permissions_remember_answers() {
        let mock = MockPermissions::new();
        mock.set_answer(Capability::Location, PermissionStatus::Denied);
        assert_eq!(
            mock.query_status(Capability::Location).await.unwrap(),
            PermissionStatus::NotDetermined
        );

        mock.request_all(&[Capability::Location]).await.unwrap();
        assert_eq!(
            mock.query_status(Capability::Location).await.unwrap(),
            PermissionStatus::Denied
        );
        assert!(mock.prompted_for(Capability::Location));
        assert!(!mock.prompted_for(Capability::ScanRadio));
    }

    #[tokio::test]
    async fn test_mock_adapter_notifies_subscribers() {
        let adapter = MockAdapter::new(AdapterState::Off);
        let mut states = adapter.subscribe_power_state().await.unwrap();
        adapter.set_state(AdapterState::TurningOn);
        adapter.set_state(AdapterState::On);
        assert_eq!(states.next().await, Some(AdapterState::TurningOn));
        assert_eq!(states.next().await, Some(AdapterState::On));
        assert_eq!(adapter.current_power_state().await.unwrap(), AdapterState::On);
    }

    #[tokio::test]
    async fn test_mock_discovery_push_and_finish() {
        let discovery = MockDiscovery::new();
        assert!(!discovery.push("AA", None));

        let mut sightings = discovery.start_scan().await.unwrap();
        assert!(discovery.push("00:11:22:33:44:55", Some("HC-05")));
        discovery.finish();

        let first = sightings.next().await.unwrap().unwrap();
        assert_eq!(first.address, "00:11:22:33:44:55");
        assert!(sightings.next().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_connector_refuse() {
        let connector = MockConnector::new();
        connector.set_behavior(
            "AA",
            ConnectBehavior::Refuse(io::ErrorKind::PermissionDenied, "nope".into()),
        );
        let err = connector.connect_by_address("AA").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(connector.attempts(), vec!["AA".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_echo_peer() {
        let connector = MockConnector::with_default(ConnectBehavior::Echo);
        let mut link = connector.connect_by_address("AA").await.unwrap();
        link.output.write_all(b"ping\r\n").await.unwrap();

        let echoed = link.input.next().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"ping\r\n");

        let peer = connector.peer("AA").unwrap();
        assert_eq!(peer.written_text(), "ping\r\n");

        link.output.shutdown().await.unwrap();
        assert!(peer.is_shut_down());
        drop(link);
        assert!(peer.is_input_released());
    }
}
