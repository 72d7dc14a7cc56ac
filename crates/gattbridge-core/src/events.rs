//! Session events and the single-listener multiplexer that delivers them.
//!
//! Every observable outcome of the session (remote-originated or the late
//! result of a command) becomes one [`SessionEvent`]. Events from both roles
//! and the scanner share one ordered stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use gattbridge_types::DeviceId;

/// Events pushed to the application.
///
/// Serialized with a `type` tag and camelCase fields, which is the shape the
/// application-side event channel expects.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[non_exhaustive]
pub enum SessionEvent {
    // --- Peripheral role ---
    PeripheralStarted,
    PeripheralStopped,
    AdvertisingStarted,
    AdvertisingFailed {
        code: i32,
    },
    ServerConnected {
        device_id: DeviceId,
        name: String,
    },
    ServerDisconnected {
        device_id: DeviceId,
    },
    /// A central wrote to the RX characteristic.
    Rx {
        char_uuid: Uuid,
        value: Bytes,
        device_id: DeviceId,
    },
    MtuChanged {
        device_id: DeviceId,
        mtu: u16,
    },
    MtuChangeFailed {
        device_id: DeviceId,
        status: i32,
    },

    // --- Scanning ---
    ScanStarted,
    ScanStopped,
    ScanFailed {
        code: i32,
    },
    #[serde(rename = "scanResult")]
    ScanResult {
        device_id: DeviceId,
        name: String,
        rssi: i16,
    },

    // --- Central role ---
    Connecting {
        device_id: DeviceId,
    },
    Connected {
        device_id: DeviceId,
    },
    /// Connecting failed (`message`) or discovery failed (`status`).
    #[serde(rename = "connectionFailed")]
    ConnectionFailed {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<i32>,
    },
    /// `status` is absent for a local disconnect.
    Disconnected {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<i32>,
    },
    WriteResult {
        device_id: DeviceId,
        char_uuid: Uuid,
        status: i32,
    },
    WriteError {
        device_id: DeviceId,
        message: String,
    },
    Notification {
        device_id: DeviceId,
        char_uuid: Uuid,
        value: Bytes,
    },

    // --- Adapter ---
    BluetoothState {
        is_on: bool,
    },
    Error {
        message: String,
    },
}

impl SessionEvent {
    /// The wire tag of this event.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::PeripheralStarted => "peripheral_started",
            SessionEvent::PeripheralStopped => "peripheral_stopped",
            SessionEvent::AdvertisingStarted => "advertising_started",
            SessionEvent::AdvertisingFailed { .. } => "advertising_failed",
            SessionEvent::ServerConnected { .. } => "server_connected",
            SessionEvent::ServerDisconnected { .. } => "server_disconnected",
            SessionEvent::Rx { .. } => "rx",
            SessionEvent::MtuChanged { .. } => "mtu_changed",
            SessionEvent::MtuChangeFailed { .. } => "mtu_change_failed",
            SessionEvent::ScanStarted => "scan_started",
            SessionEvent::ScanStopped => "scan_stopped",
            SessionEvent::ScanFailed { .. } => "scan_failed",
            SessionEvent::ScanResult { .. } => "scanResult",
            SessionEvent::Connecting { .. } => "connecting",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::ConnectionFailed { .. } => "connectionFailed",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::WriteResult { .. } => "write_result",
            SessionEvent::WriteError { .. } => "write_error",
            SessionEvent::Notification { .. } => "notification",
            SessionEvent::BluetoothState { .. } => "bluetooth_state",
            SessionEvent::Error { .. } => "error",
        }
    }

    /// The remote device this event concerns, if any.
    #[must_use]
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            SessionEvent::ServerConnected { device_id, .. }
            | SessionEvent::ServerDisconnected { device_id }
            | SessionEvent::Rx { device_id, .. }
            | SessionEvent::MtuChanged { device_id, .. }
            | SessionEvent::MtuChangeFailed { device_id, .. }
            | SessionEvent::ScanResult { device_id, .. }
            | SessionEvent::Connecting { device_id }
            | SessionEvent::Connected { device_id }
            | SessionEvent::ConnectionFailed { device_id, .. }
            | SessionEvent::Disconnected { device_id, .. }
            | SessionEvent::WriteResult { device_id, .. }
            | SessionEvent::WriteError { device_id, .. }
            | SessionEvent::Notification { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Fans every event into the currently attached listener.
///
/// There is at most one listener. Attaching replaces the previous listener,
/// whose stream then ends. Events emitted while nobody is attached are
/// discarded; nothing is buffered for a future listener.
#[derive(Debug, Default)]
pub struct EventMultiplexer {
    listener: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new listener, detaching any previous one.
    pub fn attach(&mut self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.listener.replace(tx).is_some() {
            debug!("Replacing attached event listener");
        }
        EventStream { rx }
    }

    pub fn detach(&mut self) {
        if self.listener.take().is_some() {
            debug!("Event listener detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.listener.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn emit(&mut self, event: SessionEvent) {
        let Some(tx) = &self.listener else {
            trace!("No listener, dropping {} event", event.kind());
            return;
        };
        if let Err(mpsc::error::SendError(event)) = tx.send(event) {
            debug!(
                "Event listener went away, dropping {} event",
                event.kind()
            );
            self.listener = None;
        }
    }
}

/// Receiving end handed to the attached listener.
///
/// Ends (`None`) when the listener is replaced or detached, or when the
/// session shuts down.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event queued so far.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
