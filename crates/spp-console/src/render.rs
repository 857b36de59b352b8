//! Terminal rendering of snapshots, events and intent errors

use chrono::Local;
use spp_session::{
    ConnectionState, DisconnectReason, ScanOutcome, SessionError, SessionEvent, SessionSnapshot,
};
use tokio::sync::broadcast;
use tracing::warn;

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Print a line with the local time in front
pub fn say(message: impl AsRef<str>) {
    println!("[{}] {}", timestamp(), message.as_ref());
}

/// One line per event worth showing; `None` for events the prompt already reflects
pub fn event_line(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::AdapterStateChanged(state) => format!("bluetooth {}", state),
        SessionEvent::PermissionsResolved { .. } => return None,
        SessionEvent::ScanStarted => "scanning...".to_string(),
        SessionEvent::DeviceDiscovered(device) => format!("found {}", device),
        SessionEvent::ScanFinished(ScanOutcome::Completed { devices }) => {
            format!("scan finished, {} device(s)", devices)
        }
        SessionEvent::ScanFinished(ScanOutcome::Failed { reason }) => {
            format!("scan failed: {}", reason)
        }
        SessionEvent::ScanFinished(ScanOutcome::Cancelled) => "scan stopped".to_string(),
        SessionEvent::Connecting { address } => format!("connecting to {}...", address),
        SessionEvent::Connected { address } => format!("connected to {}", address),
        SessionEvent::ConnectFailed { address, kind, .. } => {
            format!("could not connect to {}: {}", address, kind.hint())
        }
        SessionEvent::DataReceived { text, .. } => format!("< {}", text.trim_end()),
        SessionEvent::LineSent { text, .. } => format!("> {}", text),
        SessionEvent::Disconnected { address, reason } => match reason {
            DisconnectReason::Requested => format!("disconnected from {}", address),
            other => format!("{} ({})", other, address),
        },
    };
    Some(line)
}

/// Print events until the stream closes
pub async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(line) = event_line(&event) {
                    say(line);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Console fell behind the event stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Numbered device listing
pub fn devices(snapshot: &SessionSnapshot) -> String {
    if snapshot.devices.is_empty() {
        return "no devices (type `scan`)".to_string();
    }
    snapshot
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| format!("{:>3}. {}", i + 1, device))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Multi-line state summary
pub fn status(snapshot: &SessionSnapshot) -> String {
    let mut lines = vec![
        format!("adapter:     {}", snapshot.adapter_state),
        format!(
            "discovery:   {}",
            if snapshot.is_scanning() { "scanning" } else { "idle" }
        ),
        format!("devices:     {}", snapshot.devices.len()),
    ];
    let connection = match (&snapshot.connection_state, &snapshot.connected_address) {
        (ConnectionState::Open, Some(address)) => format!("open ({})", address),
        (state, _) => state.to_string(),
    };
    lines.push(format!("connection:  {}", connection));
    if let Some(reason) = &snapshot.last_disconnect {
        lines.push(format!("last close:  {}", reason));
    }
    let permissions: Vec<String> = snapshot
        .capabilities
        .iter()
        .map(|(capability, status)| format!("{}={:?}", capability, status))
        .collect();
    lines.push(format!("permissions: {}", permissions.join(" ")));
    lines.join("\n")
}

/// What to tell the user when an intent fails
pub fn intent_error(err: &SessionError) -> String {
    match err {
        SessionError::PermissionDenied {
            permanent: true, ..
        } => format!("{} - type `settings` to grant it", err),
        SessionError::AdapterNotOn(_) => "bluetooth is off - turn it on and try again".to_string(),
        SessionError::ConnectFailed { kind, .. } => format!("{} ({})", err, kind.hint()),
        _ => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spp_session::{AdapterState, DeviceRegistry, DiscoveredDevice, Sighting};

    #[test]
    fn test_event_lines() {
        assert_eq!(
            event_line(&SessionEvent::DeviceDiscovered(DiscoveredDevice::new(
                "AA:BB", "HC-05"
            ))),
            Some("found HC-05 (AA:BB)".to_string())
        );
        assert_eq!(
            event_line(&SessionEvent::Disconnected {
                address: "AA:BB".into(),
                reason: DisconnectReason::PeerClosed,
            }),
            Some("device disconnected (AA:BB)".to_string())
        );
        assert_eq!(
            event_line(&SessionEvent::PermissionsResolved {
                statuses: Default::default()
            }),
            None
        );
    }

    #[test]
    fn test_devices_numbered() {
        let mut registry = DeviceRegistry::new();
        registry.insert(Sighting::new("AA:01", Some("One"))).unwrap();
        registry.insert(Sighting::new("AA:02", Some("Two"))).unwrap();
        let snapshot = SessionSnapshot {
            devices: registry,
            ..Default::default()
        };
        assert_eq!(devices(&snapshot), "  1. One (AA:01)\n  2. Two (AA:02)");
        assert!(devices(&SessionSnapshot::default()).contains("scan"));
    }

    #[test]
    fn test_status_mentions_connection() {
        let snapshot = SessionSnapshot {
            adapter_state: AdapterState::On,
            connection_state: ConnectionState::Open,
            connected_address: Some("AA:BB".into()),
            ..Default::default()
        };
        let text = status(&snapshot);
        assert!(text.contains("open (AA:BB)"));
    }

    #[test]
    fn test_permanent_denial_points_to_settings() {
        let err = SessionError::PermissionDenied {
            denied: vec![spp_session::Capability::Location],
            permanent: true,
        };
        assert!(intent_error(&err).contains("settings"));
    }
}
