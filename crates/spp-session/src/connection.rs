//! Connection session
//!
//! Owns at most one RFCOMM link. The lifecycle is
//!
//! ```text
//!  Idle ──connect──► Connecting ──ok──► Open ──disconnect / EOF / error──► Closing ──► Idle
//!                        │                                                  ▲
//!                        └──────── fail / timeout / cancel ─────────────────┘ (straight to Idle)
//! ```
//!
//! # Teardown
//!
//! Teardown is split in two. The state half runs under the store lock: it
//! moves the connection to `Closing` and bumps the link epoch, after which
//! the reader task can no longer append to the receive buffer. The resource
//! half then runs without the lock, in a fixed order:
//!
//! 1. cancel a connect attempt still in flight
//! 2. abort the reader task and wait for it (the input subscription is gone)
//! 3. shut down and drop the output half (the socket is released)
//! 4. move to `Idle`
//!
//! Whoever wins the state half (an explicit disconnect, the reader seeing end
//! of stream, or the adapter powering down) performs the resource half; the
//! others find nothing to do. That makes disconnect idempotent.
//!
//! # Sending
//!
//! A send takes the output half out of its slot for the duration of the
//! write and puts it back only if the link it came from is still current. If
//! a teardown happened meanwhile, the send closes the output half itself.
//! Teardown interrupts a write in progress and waits for that send to
//! finish, so the socket is released before the link reports `Idle`.

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::event::{DisconnectReason, SessionEvent};
use crate::permission::PermissionGate;
use crate::platform::{ByteSink, ByteStream, ConnectionTransport, SerialLink};
use crate::snapshot::{ConnectionState, SessionStore, Tracked};
use crate::types::Capability;

/// Claimed by whoever moved the link to `Closing`
#[derive(Debug)]
pub(crate) struct Teardown {
    epoch: u64,
    address: String,
    was_open: bool,
}

/// Resources of the current link
struct Link {
    store: Arc<SessionStore>,
    writer: Mutex<Option<(u64, ByteSink)>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Set while a send holds the output half; set under the `writer` lock
    send_abort: Mutex<Option<oneshot::Sender<()>>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl Link {
    async fn finish_teardown(&self, teardown: Teardown, reason: DisconnectReason, from_reader: bool) {
        if let Some(cancel) = self.cancel.lock().take() {
            let _ = cancel.send(());
        }

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if !from_reader {
                reader.abort();
                let _ = reader.await;
            }
        }

        let writer = self.writer.lock().take();
        match writer {
            Some((_, mut writer)) => {
                if let Err(e) = writer.shutdown().await {
                    debug!(error = %e, "Output shutdown failed");
                }
            }
            None => {
                // A send may hold the output half; it shuts it down once aborted
                let abort = self.send_abort.lock().take();
                if let Some(abort) = abort {
                    let _ = abort.send(());
                }
                let _ = self.send_lock.lock().await;
            }
        }

        let closed = self.store.update(|t| {
            let current = t.link_epoch == teardown.epoch
                && t.snapshot.connection_state == ConnectionState::Closing;
            if !current {
                return false;
            }
            t.snapshot.connection_state = ConnectionState::Idle;
            t.snapshot.connected_address = None;
            t.target_address = None;
            if teardown.was_open {
                t.snapshot.last_disconnect = Some(reason.clone());
            }
            true
        });

        if closed && teardown.was_open {
            info!(address = %teardown.address, %reason, "Disconnected");
            self.store.emit(SessionEvent::Disconnected {
                address: teardown.address,
                reason,
            });
        } else if closed {
            debug!(address = %teardown.address, "Connect attempt abandoned");
        }
    }

    async fn read_loop(self: Arc<Self>, mut input: ByteStream, epoch: u64, address: String) {
        let reason = loop {
            match input.next().await {
                Some(Ok(chunk)) => {
                    if !self.append(&chunk, epoch, &address) {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(address = %address, error = %e, "Input stream failed");
                    break DisconnectReason::StreamError {
                        message: e.to_string(),
                    };
                }
                None => {
                    info!(address = %address, "Peer closed the connection");
                    break DisconnectReason::PeerClosed;
                }
            }
        };

        let teardown = self.store.update(|t| {
            if t.link_epoch != epoch {
                return None;
            }
            ConnectionSession::begin_teardown(t)
        });
        if let Some(teardown) = teardown {
            self.finish_teardown(teardown, reason, true).await;
        }
    }

    /// Append a chunk unless the link was torn down
    fn append(&self, chunk: &Bytes, epoch: u64, address: &str) -> bool {
        let text = String::from_utf8_lossy(chunk).into_owned();
        let accepted = self.store.update(|t| {
            if t.link_epoch != epoch || t.snapshot.connection_state != ConnectionState::Open {
                return false;
            }
            t.snapshot.received_text.push_str(&text);
            true
        });
        if accepted {
            trace!(address, bytes = chunk.len(), "Received");
            self.store.emit(SessionEvent::DataReceived {
                address: address.to_string(),
                text,
            });
        }
        accepted
    }
}

/// At most one RFCOMM link
pub struct ConnectionSession {
    transport: Arc<dyn ConnectionTransport>,
    gate: Arc<PermissionGate>,
    store: Arc<SessionStore>,
    line_terminator: String,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    link: Arc<Link>,
}

impl ConnectionSession {
    pub(crate) fn new(
        transport: Arc<dyn ConnectionTransport>,
        gate: Arc<PermissionGate>,
        store: Arc<SessionStore>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            transport,
            gate,
            store: store.clone(),
            line_terminator: config.line_terminator.clone(),
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
            link: Arc::new(Link {
                store,
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                cancel: Mutex::new(None),
                send_abort: Mutex::new(None),
                send_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Open a serial link to `address`
    ///
    /// Fails without side effects when a link already exists. Prompts for
    /// the connect capability if needed. On success the receive buffer is
    /// empty and the reader is running.
    pub async fn connect(&self, address: &str) -> Result<()> {
        if let Some(existing) = self.active_address() {
            return Err(SessionError::AlreadyConnected { address: existing });
        }

        self.gate
            .request(&[Capability::ConnectRadio])
            .await?
            .into_result()?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let epoch = self.store.update(|t| {
            if t.snapshot.connection_state != ConnectionState::Idle {
                return Err(SessionError::AlreadyConnected {
                    address: t.target_address.clone().unwrap_or_default(),
                });
            }
            if !t.snapshot.adapter_state.is_on() {
                return Err(SessionError::AdapterNotOn(t.snapshot.adapter_state));
            }
            t.link_epoch += 1;
            t.snapshot.connection_state = ConnectionState::Connecting;
            t.target_address = Some(address.to_string());
            Ok(t.link_epoch)
        })?;
        *self.link.cancel.lock() = Some(cancel_tx);

        info!(address, "Connecting");
        self.store.emit(SessionEvent::Connecting {
            address: address.to_string(),
        });

        let result = tokio::select! {
            result = self.handshake(address) => result,
            _ = cancel_rx => Err(SessionError::ConnectCancelled {
                address: address.to_string(),
            }),
        };
        self.link.cancel.lock().take();

        match result {
            Ok(link) => self.open(link, epoch, address),
            Err(e) => {
                let reverted = self.store.update(|t| {
                    if t.link_epoch != epoch
                        || t.snapshot.connection_state != ConnectionState::Connecting
                    {
                        return false;
                    }
                    t.snapshot.connection_state = ConnectionState::Idle;
                    t.target_address = None;
                    true
                });
                warn!(address, error = %e, code = e.error_code(), "Connect failed");
                if reverted {
                    if let SessionError::ConnectFailed { kind, reason, .. } = &e {
                        self.store.emit(SessionEvent::ConnectFailed {
                            address: address.to_string(),
                            kind: *kind,
                            reason: reason.clone(),
                        });
                    }
                }
                Err(e)
            }
        }
    }

    /// Write `text` followed by the line terminator and flush
    ///
    /// A failed write leaves the link open.
    pub async fn send(&self, text: &str) -> Result<()> {
        let _serial = self.link.send_lock.lock().await;

        let (epoch, address) = self
            .store
            .read(|t| {
                (t.snapshot.connection_state == ConnectionState::Open)
                    .then(|| (t.link_epoch, t.target_address.clone().unwrap_or_default()))
            })
            .ok_or(SessionError::NotConnected)?;

        let (mut sink, abort_rx) = {
            let mut slot = self.link.writer.lock();
            match slot.take() {
                Some((owner, sink)) if owner == epoch => {
                    let (abort_tx, abort_rx) = oneshot::channel();
                    *self.link.send_abort.lock() = Some(abort_tx);
                    (sink, abort_rx)
                }
                other => {
                    *slot = other;
                    return Err(SessionError::NotConnected);
                }
            }
        };

        let mut payload = String::with_capacity(text.len() + self.line_terminator.len());
        payload.push_str(text);
        payload.push_str(&self.line_terminator);
        let result = tokio::select! {
            biased;
            _ = abort_rx => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "link closed during send",
            )),
            result = write_line(&mut sink, payload.as_bytes(), self.send_timeout) => result,
        };
        self.link.send_abort.lock().take();

        let link = self.link.clone();
        let orphaned = self.store.update(move |t| {
            if t.link_epoch == epoch && t.snapshot.connection_state == ConnectionState::Open {
                *link.writer.lock() = Some((epoch, sink));
                None
            } else {
                Some(sink)
            }
        });
        if let Some(mut sink) = orphaned {
            let _ = sink.shutdown().await;
        }

        match result {
            Ok(()) => {
                debug!(address = %address, bytes = payload.len(), "Sent");
                self.store.emit(SessionEvent::LineSent {
                    address,
                    text: text.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Send failed");
                Err(SessionError::SendFailed(e.to_string()))
            }
        }
    }

    /// Close the link
    ///
    /// Never fails; a no-op when idle. A connect still in flight is
    /// cancelled.
    pub async fn disconnect(&self) {
        let teardown = self.store.update(Self::begin_teardown);
        match teardown {
            Some(teardown) => {
                self.link
                    .finish_teardown(teardown, DisconnectReason::Requested, false)
                    .await
            }
            None => debug!("Disconnect with no link"),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.store.read(|t| t.snapshot.connection_state)
    }

    /// Text received on the current link
    pub fn received_text(&self) -> String {
        self.store.read(|t| t.snapshot.received_text.clone())
    }

    /// Address of the link in any non-idle state
    pub fn active_address(&self) -> Option<String> {
        self.store.read(|t| match t.snapshot.connection_state {
            ConnectionState::Idle => None,
            _ => Some(t.target_address.clone().unwrap_or_default()),
        })
    }

    /// State half of a teardown; runs under the store lock
    pub(crate) fn begin_teardown(t: &mut Tracked) -> Option<Teardown> {
        let was_open = match t.snapshot.connection_state {
            ConnectionState::Open => true,
            ConnectionState::Connecting => false,
            ConnectionState::Idle | ConnectionState::Closing => return None,
        };
        t.link_epoch += 1;
        t.snapshot.connection_state = ConnectionState::Closing;
        Some(Teardown {
            epoch: t.link_epoch,
            address: t.target_address.clone().unwrap_or_default(),
            was_open,
        })
    }

    /// Resource half of a teardown
    pub(crate) async fn finish_teardown(&self, teardown: Teardown, reason: DisconnectReason) {
        self.link.finish_teardown(teardown, reason, false).await
    }

    async fn handshake(&self, address: &str) -> Result<SerialLink> {
        let attempt = self.transport.connect_by_address(address);
        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(SessionError::ConnectTimeout {
                        address: address.to_string(),
                        duration_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => attempt.await,
        };
        result.map_err(|e| SessionError::connect_failed(address, &e))
    }

    fn open(&self, link: SerialLink, epoch: u64, address: &str) -> Result<()> {
        let SerialLink { input, output } = link;

        let slot = self.link.clone();
        let rejected = self.store.update(move |t| {
            if t.link_epoch != epoch || t.snapshot.connection_state != ConnectionState::Connecting {
                return Some(output);
            }
            t.snapshot.connection_state = ConnectionState::Open;
            t.snapshot.connected_address = Some(address.to_string());
            t.snapshot.received_text.clear();
            t.snapshot.last_disconnect = None;
            *slot.writer.lock() = Some((epoch, output));
            None
        });

        if let Some(mut output) = rejected {
            // Torn down while the handshake was completing
            tokio::spawn(async move {
                let _ = output.shutdown().await;
            });
            return Err(SessionError::ConnectCancelled {
                address: address.to_string(),
            });
        }

        info!(address, "Connected");
        self.store.emit(SessionEvent::Connected {
            address: address.to_string(),
        });

        let reader = tokio::spawn(self.link.clone().read_loop(input, epoch, address.to_string()));
        *self.link.reader.lock() = Some(reader);

        // A teardown between the open transition and storing the handle missed the reader
        if self.store.read(|t| t.link_epoch != epoch) {
            if let Some(reader) = self.link.reader.lock().take() {
                reader.abort();
            }
        }
        Ok(())
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(reader) = self.link.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn write_line(sink: &mut ByteSink, bytes: &[u8], limit: Option<Duration>) -> io::Result<()> {
    let write = async {
        sink.write_all(bytes).await?;
        sink.flush().await
    };
    match limit {
        Some(limit) => tokio::time::timeout(limit, write)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send timed out"))?,
        None => write.await,
    }
}
