//! BlueZ backend
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. Linux has no runtime
//! permission prompts for Bluetooth, so permissions come from
//! [`UnrestrictedPermissions`].
//!
//! BlueZ reports a device as soon as it answers an inquiry and resolves its
//! name later; the name is read once when the device is added, so a device
//! whose name arrives late is dropped by the registry for that scan.

use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr, Stream};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, Session};
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ConnectionTransport, DiscoveryTransport, Platform, PowerStateStream, RadioAdapter, SerialLink,
    SightingStream, UnrestrictedPermissions,
};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::types::{AdapterState, Sighting};

/// BlueZ-backed adapter, inquiry and RFCOMM connector
pub struct BluezPlatform {
    _session: Session,
    adapter: Adapter,
    channel: u8,
    scan_duration: Duration,
}

impl BluezPlatform {
    /// Open the default adapter
    pub async fn new(config: &SessionConfig) -> Result<Arc<Self>> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!(
            adapter = adapter.name(),
            channel = config.rfcomm_channel,
            "Using BlueZ adapter"
        );
        Ok(Arc::new(Self {
            _session: session,
            adapter,
            channel: config.rfcomm_channel,
            scan_duration: config.scan_duration,
        }))
    }

    /// Bundle this backend as a [`Platform`]
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform::new(
            Arc::new(UnrestrictedPermissions),
            self.clone(),
            self.clone(),
            self.clone(),
        )
    }
}

#[async_trait]
impl RadioAdapter for BluezPlatform {
    async fn current_power_state(&self) -> Result<AdapterState> {
        let powered = self.adapter.is_powered().await?;
        Ok(if powered {
            AdapterState::On
        } else {
            AdapterState::Off
        })
    }

    async fn subscribe_power_state(&self) -> Result<PowerStateStream> {
        let events = self.adapter.events().await?;
        let states = events.filter_map(|event| async move {
            match event {
                AdapterEvent::PropertyChanged(AdapterProperty::Powered(true)) => {
                    Some(AdapterState::On)
                }
                AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
                    Some(AdapterState::Off)
                }
                _ => None,
            }
        });
        Ok(states.boxed())
    }
}

#[async_trait]
impl DiscoveryTransport for BluezPlatform {
    async fn start_scan(&self) -> Result<SightingStream> {
        let filter = DiscoveryFilter {
            transport: bluer::DiscoveryTransport::BrEdr,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let events = self.adapter.discover_devices().await?;
        let adapter = self.adapter.clone();
        let sightings = events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    let AdapterEvent::DeviceAdded(addr) = event else {
                        return None;
                    };
                    let name = match adapter.device(addr) {
                        Ok(device) => device.name().await.ok().flatten(),
                        Err(_) => None,
                    };
                    debug!(address = %addr, ?name, "Inquiry response");
                    Some(Ok(Sighting {
                        address: addr.to_string(),
                        display_name: name,
                    }))
                }
            })
            .take_until(tokio::time::sleep(self.scan_duration));
        Ok(sightings.boxed())
    }

    async fn cancel_scan(&self) -> Result<()> {
        // Discovery stops when the session drops the event stream
        debug!("BlueZ discovery released");
        Ok(())
    }
}

#[async_trait]
impl ConnectionTransport for BluezPlatform {
    async fn connect_by_address(&self, address: &str) -> io::Result<SerialLink> {
        let addr: Address = address.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid address {}: {}", address, e),
            )
        })?;
        let stream = Stream::connect(SocketAddr::new(addr, self.channel)).await?;
        let (reader, writer) = stream.into_split();
        Ok(SerialLink::from_split(reader, writer))
    }
}
