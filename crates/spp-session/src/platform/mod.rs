//! Platform collaborator traits
//!
//! The session core never talks to a radio stack directly. It depends on
//! four narrow capabilities, each an async trait object:
//!
//! - [`PermissionProvider`] - OS permission status and prompts
//! - [`RadioAdapter`] - radio power state and its change stream
//! - [`DiscoveryTransport`] - inquiry scan producing [`Sighting`]s
//! - [`ConnectionTransport`] - RFCOMM connect returning a [`SerialLink`]
//!
//! [`Platform`] bundles one implementation of each. Backends:
//!
//! - [`crate::test_utils::MockPlatform`] - scriptable, always available
//! - [`bluez::BluezPlatform`] - Linux BlueZ (requires `bluez` feature)
//!   ```bash
//!   apt install libdbus-1-dev pkg-config
//!   ```

#[cfg(feature = "bluez")]
pub mod bluez;

#[cfg(feature = "bluez")]
pub use bluez::BluezPlatform;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::error::Result;
use crate::types::{AdapterState, Capability, PermissionStatus, Sighting};

/// Size of each read issued against a socket input half
const READ_CHUNK_SIZE: usize = 1024;

/// Inbound bytes from a peer; stream end means the peer closed the socket
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Outbound half of a socket
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Sightings from one inquiry; an `Err` item is a scan failure, stream end is completion
pub type SightingStream = BoxStream<'static, Result<Sighting>>;

/// Radio power transitions in the order the stack reported them
pub type PowerStateStream = BoxStream<'static, AdapterState>;

/// OS permission model
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Current status, without prompting
    async fn query_status(&self, capability: Capability) -> Result<PermissionStatus>;

    /// Prompt for every listed capability in one batch
    async fn request_all(
        &self,
        capabilities: &[Capability],
    ) -> Result<HashMap<Capability, PermissionStatus>>;

    /// Take the user to the system settings page for this app
    async fn open_system_settings(&self) -> Result<()>;
}

/// Local radio power state
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Current power state
    async fn current_power_state(&self) -> Result<AdapterState>;

    /// Subscribe to power state changes
    async fn subscribe_power_state(&self) -> Result<PowerStateStream>;
}

/// Inquiry scan
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Start an inquiry
    async fn start_scan(&self) -> Result<SightingStream>;

    /// Cancel the running inquiry, if any
    async fn cancel_scan(&self) -> Result<()>;
}

/// RFCOMM connector
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// Open a serial socket to the device at `address`
    ///
    /// Fails on timeout, refusal, or an unavailable peer. The error is
    /// inspected to classify the failure for the user.
    async fn connect_by_address(&self, address: &str) -> io::Result<SerialLink>;
}

/// Both halves of an open serial socket
///
/// Closing is `shutdown` on the output half followed by dropping both.
pub struct SerialLink {
    /// Inbound bytes
    pub input: ByteStream,
    /// Outbound bytes
    pub output: ByteSink,
}

impl SerialLink {
    /// Bundle the two halves
    pub fn new(input: ByteStream, output: ByteSink) -> Self {
        Self { input, output }
    }

    /// Build a link from split halves of an async socket
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(read_chunks(reader), Box::new(writer))
    }
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink").finish_non_exhaustive()
    }
}

/// Turn an async reader into a stream of chunks
///
/// The stream ends on EOF and after yielding the first read error.
pub fn read_chunks<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    futures::stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Permission provider for platforms without a permission model
///
/// Every capability is always granted and no prompt is ever shown.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnrestrictedPermissions;

#[async_trait]
impl PermissionProvider for UnrestrictedPermissions {
    async fn query_status(&self, _capability: Capability) -> Result<PermissionStatus> {
        Ok(PermissionStatus::Granted)
    }

    async fn request_all(
        &self,
        capabilities: &[Capability],
    ) -> Result<HashMap<Capability, PermissionStatus>> {
        Ok(capabilities
            .iter()
            .map(|c| (*c, PermissionStatus::Granted))
            .collect())
    }

    async fn open_system_settings(&self) -> Result<()> {
        Ok(())
    }
}

/// One implementation of each collaborator
#[derive(Clone)]
pub struct Platform {
    /// Permission model
    pub permissions: Arc<dyn PermissionProvider>,
    /// Radio power state
    pub adapter: Arc<dyn RadioAdapter>,
    /// Inquiry scan
    pub discovery: Arc<dyn DiscoveryTransport>,
    /// RFCOMM connector
    pub connector: Arc<dyn ConnectionTransport>,
}

impl Platform {
    /// Bundle collaborators
    pub fn new(
        permissions: Arc<dyn PermissionProvider>,
        adapter: Arc<dyn RadioAdapter>,
        discovery: Arc<dyn DiscoveryTransport>,
        connector: Arc<dyn ConnectionTransport>,
    ) -> Self {
        Self {
            permissions,
            adapter,
            discovery,
            connector,
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_unrestricted_permissions_grant_everything() {
        let provider = UnrestrictedPermissions;
        let statuses = provider.request_all(&Capability::ALL).await.unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.values().all(PermissionStatus::is_granted));
        assert!(provider
            .query_status(Capability::Location)
            .await
            .unwrap()
            .is_granted());
    }

    #[tokio::test]
    async fn test_read_chunks_until_eof() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut chunks = read_chunks(far);

        near.write_all(b"hello").await.unwrap();
        let first = chunks.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello");

        drop(near);
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn test_link_from_split() {
        let (near, far) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(far);
        let mut link = SerialLink::from_split(reader, writer);
        let (mut near_reader, mut near_writer) = tokio::io::split(near);

        link.output.write_all(b"ping").await.unwrap();
        link.output.flush().await.unwrap();
        let mut buf = [0u8; 4];
        near_reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        near_writer.write_all(b"pong").await.unwrap();
        let chunk = link.input.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"pong");
    }
}
