//! GATT client role: one connection state machine per remote device.
//!
//! Entries are created eagerly by `connect` and removed on every path that
//! ends a link (local disconnect, remote drop, connect failure), so a device
//! id is never present twice and no `Connecting` entry outlives its attempt.
//! Each entry carries the [`LinkId`] of its attempt; hardware callbacks whose
//! link does not match the current entry are stray and ignored.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattbridge_types::uuid::{CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE, parse_uuid};
use gattbridge_types::{
    ATT_HEADER_LEN, CharacteristicProperties, DeviceId, DiscoveredCharacteristic, MIN_ATT_MTU,
    WriteType,
};

use crate::backend::{BleBackend, LinkEvent, LinkId};
use crate::config::{AutoSubscribe, CentralConfig, DiscoveryFailurePolicy};
use crate::error::{Error, Result};
use crate::events::{EventMultiplexer, SessionEvent};

/// Per-device connection phase. A device with no entry is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Link is up; services are being discovered.
    DiscoveringServices,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Whether the transport link is established.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::DiscoveringServices | ConnectionState::Connected
        )
    }
}

/// Bookkeeping for one remote device.
#[derive(Debug, Clone)]
pub struct CentralConnection {
    pub link: LinkId,
    pub state: ConnectionState,
    /// In discovery order.
    pub characteristics: Vec<DiscoveredCharacteristic>,
    /// Characteristic of the most recent write still awaiting completion.
    pub pending_write: Option<Uuid>,
    pub mtu: u16,
}

impl CentralConnection {
    fn new(link: LinkId) -> Self {
        Self {
            link,
            state: ConnectionState::Connecting,
            characteristics: Vec::new(),
            pending_write: None,
            mtu: MIN_ATT_MTU,
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&DiscoveredCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// All GATT client connections of a session.
pub struct ConnectionRegistry {
    backend: Arc<dyn BleBackend>,
    config: CentralConfig,
    connections: HashMap<DeviceId, CentralConnection>,
    next_generation: u64,
}

impl ConnectionRegistry {
    pub fn new(backend: Arc<dyn BleBackend>, config: CentralConfig) -> Self {
        Self {
            backend,
            config,
            connections: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&CentralConnection> {
        self.connections.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Devices whose link is established, including those still discovering.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.state.is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// ATT MTU of an established link; 23 until a larger one is negotiated.
    pub fn mtu(&self, device_id: &str) -> Option<u16> {
        self.connections
            .get(device_id)
            .filter(|conn| conn.state.is_connected())
            .map(|conn| conn.mtu)
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connections
            .get(device_id)
            .is_some_and(|conn| conn.state.is_connected())
    }

    /// Start connecting to `device_id`.
    ///
    /// Returns once the connect request is queued; `connected` or
    /// `connectionFailed` follows.
    pub async fn connect(&mut self, device_id: &str, events: &mut EventMultiplexer) -> Result<()> {
        let device_id = DeviceId::parse(device_id)?;
        if !self.backend.is_powered().await {
            return Err(Error::BluetoothOff);
        }
        if self.connections.contains_key(&device_id) {
            return Err(Error::AlreadyConnected(device_id));
        }
        self.backend
            .resolve_device(&device_id)
            .await
            .map_err(|e| Error::from_backend("resolve_device", e))?;

        let link = LinkId::new(device_id.clone(), self.next_generation);
        self.next_generation += 1;
        self.connections
            .insert(device_id.clone(), CentralConnection::new(link.clone()));

        if let Err(e) = self.backend.connect(&link).await {
            warn!("Connect request for {} refused: {}", device_id, e);
            self.connections.remove(&device_id);
            self.backend.release(&link).await;
            events.emit(SessionEvent::ConnectionFailed {
                device_id,
                message: Some(e.to_string()),
                status: None,
            });
            return Err(Error::from_backend("connect", e));
        }

        info!("Connecting to {}", device_id);
        events.emit(SessionEvent::Connecting { device_id });
        Ok(())
    }

    /// Queue a write to a discovered characteristic.
    ///
    /// Success means the write was accepted for submission; `write_result`
    /// or `write_error` reports completion.
    pub async fn write_characteristic(
        &mut self,
        device_id: &str,
        char_uuid: &str,
        value: Bytes,
        events: &mut EventMultiplexer,
    ) -> Result<()> {
        let device_id = DeviceId::parse(device_id)?;
        let uuid = parse_uuid(char_uuid)?;

        let conn = match self.connections.get_mut(&device_id) {
            Some(conn) if conn.state.is_connected() => conn,
            _ => return Err(Error::NotConnected(device_id)),
        };
        let characteristic = *conn
            .characteristic(uuid)
            .ok_or_else(|| Error::characteristic_not_found(uuid))?;
        let write_type = characteristic.preferred_write_type();

        if let Err(e) = self
            .backend
            .write_characteristic(&conn.link, &characteristic, value, write_type)
            .await
        {
            warn!("Write to {} on {} refused: {}", uuid, device_id, e);
            events.emit(SessionEvent::WriteError {
                device_id: device_id.clone(),
                message: e.to_string(),
            });
            return Err(Error::WriteRejected {
                device_id,
                uuid,
                reason: e.to_string(),
            });
        }

        debug!("Queued write {} to {} on {}", write_type, uuid, device_id);
        conn.pending_write = Some(uuid);
        Ok(())
    }

    /// Negotiate a larger MTU, or report the current one where the platform
    /// negotiates on its own.
    pub async fn request_mtu(
        &mut self,
        device_id: &str,
        mtu: u16,
        events: &mut EventMultiplexer,
    ) -> Result<()> {
        let device_id = DeviceId::parse(device_id)?;
        let conn = match self.connections.get_mut(&device_id) {
            Some(conn) if conn.state.is_connected() => conn,
            _ => return Err(Error::NotConnected(device_id)),
        };
        let mtu = mtu.clamp(MIN_ATT_MTU, self.config.max_mtu);

        if self.backend.capabilities().client_mtu_request {
            if let Err(e) = self.backend.request_mtu(&conn.link, mtu).await {
                warn!("MTU request for {} refused: {}", device_id, e);
                events.emit(SessionEvent::MtuChangeFailed {
                    device_id: device_id.clone(),
                    status: -1,
                });
                return Err(Error::MtuRequestRejected {
                    device_id,
                    reason: e.to_string(),
                });
            }
            debug!("Requested MTU {} for {}", mtu, device_id);
            return Ok(());
        }

        let capacity = self
            .backend
            .max_write_len(&conn.link, WriteType::WithoutResponse)
            .await
            .ok_or_else(|| Error::unsupported("MTU negotiation"))?;
        let effective = capacity.saturating_add(ATT_HEADER_LEN);
        conn.mtu = effective;
        debug!("Effective MTU for {} is {}", device_id, effective);
        events.emit(SessionEvent::MtuChanged {
            device_id,
            mtu: effective,
        });
        Ok(())
    }

    /// Tear down the link to `device_id`. No entry is a no-op.
    pub async fn disconnect(&mut self, device_id: &DeviceId, events: &mut EventMultiplexer) {
        let Some(conn) = self.connections.get_mut(device_id) else {
            debug!("Disconnect for {} ignored, not connected", device_id);
            return;
        };
        conn.state = ConnectionState::Disconnecting;
        let link = conn.link.clone();

        if let Err(e) = self.backend.disconnect(&link).await {
            warn!("Disconnect of {} failed: {}", device_id, e);
        }
        self.backend.release(&link).await;
        self.connections.remove(device_id);

        info!("Disconnected from {}", device_id);
        events.emit(SessionEvent::Disconnected {
            device_id: device_id.clone(),
            status: None,
        });
    }

    /// Disconnect every device present when the call starts.
    pub async fn disconnect_all(&mut self, events: &mut EventMultiplexer) {
        let snapshot: Vec<DeviceId> = self.connections.keys().cloned().collect();
        for device_id in &snapshot {
            self.disconnect(device_id, events).await;
        }
    }

    /// Apply a callback from a client link.
    pub async fn handle_event(&mut self, event: LinkEvent, events: &mut EventMultiplexer) {
        let link = event.link().clone();
        let device_id = link.device.clone();
        let Some(conn) = self
            .connections
            .get_mut(&device_id)
            .filter(|conn| conn.link == link)
        else {
            debug!("Ignoring stray {} for {}", event.name(), link);
            return;
        };

        match event {
            LinkEvent::Connected { .. } => {
                if conn.state != ConnectionState::Connecting {
                    debug!("Duplicate connected callback for {}", link);
                    return;
                }
                conn.state = ConnectionState::DiscoveringServices;
                info!("Connected to {}", device_id);
                events.emit(SessionEvent::Connected {
                    device_id: device_id.clone(),
                });
                if let Err(e) = self.backend.discover_services(&link).await {
                    warn!("Service discovery for {} refused: {}", device_id, e);
                    self.discovery_failed(&device_id, -1, events).await;
                }
            }
            LinkEvent::ConnectFailed { message, .. } => {
                warn!("Connection to {} failed: {}", device_id, message);
                self.remove(&link).await;
                events.emit(SessionEvent::ConnectionFailed {
                    device_id,
                    message: Some(message),
                    status: None,
                });
            }
            LinkEvent::Disconnected { status, .. } => {
                let was_connecting = conn.state == ConnectionState::Connecting;
                self.remove(&link).await;
                if was_connecting {
                    warn!("Link to {} dropped while connecting (status {})", device_id, status);
                    events.emit(SessionEvent::ConnectionFailed {
                        device_id,
                        message: Some(format!("Disconnected while connecting, status {}", status)),
                        status: None,
                    });
                } else {
                    info!("{} disconnected (status {})", device_id, status);
                    events.emit(SessionEvent::Disconnected {
                        device_id,
                        status: Some(status),
                    });
                }
            }
            LinkEvent::ServicesDiscovered {
                characteristics, ..
            } => {
                if !conn.state.is_connected() {
                    debug!("Discovery result for {} while {:?}", device_id, conn.state);
                    return;
                }
                info!(
                    "Discovered {} characteristics on {}",
                    characteristics.len(),
                    device_id
                );
                conn.characteristics = characteristics;
                conn.state = ConnectionState::Connected;
                let policy = self.config.auto_subscribe;
                let subscriptions: Vec<_> = conn
                    .characteristics
                    .iter()
                    .filter_map(|c| subscription_for(policy, c).map(|value| (*c, value)))
                    .collect();
                for (characteristic, value) in subscriptions {
                    self.subscribe(&link, &characteristic, value).await;
                }
            }
            LinkEvent::DiscoveryFailed { status, .. } => {
                self.discovery_failed(&device_id, status, events).await;
            }
            LinkEvent::ValueChanged {
                characteristic,
                value,
                ..
            } => {
                events.emit(SessionEvent::Notification {
                    device_id,
                    char_uuid: characteristic,
                    value,
                });
            }
            LinkEvent::WriteCompleted {
                characteristic,
                status,
                ..
            } => {
                if conn.pending_write == Some(characteristic) {
                    conn.pending_write = None;
                }
                events.emit(SessionEvent::WriteResult {
                    device_id,
                    char_uuid: characteristic,
                    status,
                });
            }
            LinkEvent::WriteFailed {
                characteristic,
                message,
                ..
            } => {
                if conn.pending_write == Some(characteristic) {
                    conn.pending_write = None;
                }
                warn!("Write to {} on {} failed: {}", characteristic, device_id, message);
                events.emit(SessionEvent::WriteError { device_id, message });
            }
            LinkEvent::MtuChanged { mtu, status, .. } => {
                if status == 0 {
                    conn.mtu = mtu;
                    debug!("MTU for {} is now {}", device_id, mtu);
                    events.emit(SessionEvent::MtuChanged { device_id, mtu });
                } else {
                    warn!("MTU change for {} failed with status {}", device_id, status);
                    events.emit(SessionEvent::MtuChangeFailed { device_id, status });
                }
            }
        }
    }

    async fn subscribe(&self, link: &LinkId, characteristic: &DiscoveredCharacteristic, value: [u8; 2]) {
        if let Err(e) = self.backend.set_notify(link, characteristic, true).await {
            warn!(
                "Enabling notifications on {} for {} failed: {}",
                characteristic.uuid, link.device, e
            );
            return;
        }
        if self.backend.capabilities().explicit_cccd_write {
            if let Err(e) = self
                .backend
                .write_descriptor(
                    link,
                    characteristic,
                    CLIENT_CHARACTERISTIC_CONFIG,
                    Bytes::copy_from_slice(&value),
                )
                .await
            {
                warn!(
                    "CCCD write on {} for {} failed: {}",
                    characteristic.uuid, link.device, e
                );
                return;
            }
        }
        debug!("Subscribed to {} on {}", characteristic.uuid, link.device);
    }

    async fn discovery_failed(
        &mut self,
        device_id: &DeviceId,
        status: i32,
        events: &mut EventMultiplexer,
    ) {
        warn!("Service discovery for {} failed with status {}", device_id, status);
        events.emit(SessionEvent::ConnectionFailed {
            device_id: device_id.clone(),
            message: None,
            status: Some(status),
        });
        match self.config.discovery_failure {
            DiscoveryFailurePolicy::KeepConnected => {
                if let Some(conn) = self.connections.get_mut(device_id) {
                    conn.state = ConnectionState::Connected;
                }
            }
            DiscoveryFailurePolicy::Disconnect => self.disconnect(device_id, events).await,
        }
    }

    /// Drop the entry for `link` and its platform handles.
    async fn remove(&mut self, link: &LinkId) {
        self.connections.remove(&link.device);
        self.backend.release(link).await;
    }
}

/// The CCCD value to auto-subscribe with under `policy`, if any.
fn subscription_for(
    policy: AutoSubscribe,
    characteristic: &DiscoveredCharacteristic,
) -> Option<[u8; 2]> {
    match policy {
        AutoSubscribe::NotifyOrIndicate => characteristic.subscription_value(),
        AutoSubscribe::NotifyOnly => characteristic
            .properties
            .contains(CharacteristicProperties::NOTIFY)
            .then_some(ENABLE_NOTIFICATION_VALUE),
        AutoSubscribe::Disabled => None,
    }
}
