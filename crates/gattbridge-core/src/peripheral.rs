//! GATT server role: one advertised service, its subscribers, and
//! notification fan-out.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gattbridge_types::uuid::{CLIENT_CHARACTERISTIC_CONFIG, parse_uuid};
use gattbridge_types::{AttStatus, DeviceId, ServiceDescriptor, read_at_offset};

use crate::backend::{AttResponse, BackendError, BleBackend, RequestId, ServerEvent};
use crate::error::{Error, Result};
use crate::events::{EventMultiplexer, SessionEvent};

/// Lifecycle of the peripheral role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Stopped,
    /// Server open, advertising requested but not yet confirmed.
    Starting,
    Advertising,
}

/// State of the GATT server role.
///
/// `service` is `Some` exactly while the state is not `Stopped`.
pub struct PeripheralSession {
    backend: Arc<dyn BleBackend>,
    state: PeripheralState,
    service: Option<ServiceDescriptor>,
    /// Centrals currently subscribed to TX.
    subscribers: HashSet<DeviceId>,
    /// Centrals seen since the server opened; `subscribers` is a subset.
    centrals: HashSet<DeviceId>,
    /// Last value set on TX, served to reads.
    tx_value: Option<Bytes>,
    unknown_name: String,
}

impl PeripheralSession {
    pub fn new(backend: Arc<dyn BleBackend>, unknown_name: impl Into<String>) -> Self {
        Self {
            backend,
            state: PeripheralState::Stopped,
            service: None,
            subscribers: HashSet::new(),
            centrals: HashSet::new(),
            tx_value: None,
            unknown_name: unknown_name.into(),
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn service(&self) -> Option<&ServiceDescriptor> {
        self.service.as_ref()
    }

    pub fn is_subscribed(&self, central: &DeviceId) -> bool {
        self.subscribers.contains(central)
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &DeviceId> {
        self.subscribers.iter()
    }

    /// Open the GATT server and request advertising.
    ///
    /// Returns once advertising has been requested; `peripheral_started`
    /// follows when the radio confirms.
    pub async fn start(
        &mut self,
        service_uuid: &str,
        tx_uuid: &str,
        rx_uuid: &str,
        events: &mut EventMultiplexer,
    ) -> Result<()> {
        if self.state != PeripheralState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        let service = ServiceDescriptor::parse(service_uuid, tx_uuid, rx_uuid)?;

        if !self.backend.capabilities().peripheral_role {
            return Err(Error::unsupported("peripheral role"));
        }
        if !self.backend.is_powered().await {
            return Err(Error::BluetoothOff);
        }

        if let Err(e) = self.backend.open_server(&service).await {
            warn!("Cannot open GATT server: {}", e);
            events.emit(SessionEvent::Error {
                message: format!("Cannot open GATT server: {}", e),
            });
            return Err(Error::from_backend("open_server", e));
        }
        self.service = Some(service);
        self.state = PeripheralState::Starting;

        if let Err(e) = self.backend.start_advertising(service.service_uuid).await {
            let code = match e {
                BackendError::Advertising { code } => code,
                _ => -1,
            };
            warn!("Advertising refused for {}: {}", service.service_uuid, e);
            self.teardown().await;
            events.emit(SessionEvent::AdvertisingFailed { code });
            return Err(Error::AdvertisingFailed { code });
        }

        info!("Advertising requested for service {}", service.service_uuid);
        Ok(())
    }

    /// Tear down advertising and the server. Never fails.
    pub async fn stop(&mut self, events: &mut EventMultiplexer) {
        self.teardown().await;
        info!("Peripheral stopped");
        events.emit(SessionEvent::PeripheralStopped);
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.backend.stop_advertising().await {
            warn!("Failed to stop advertising: {}", e);
        }
        if let Err(e) = self.backend.close_server().await {
            warn!("Failed to close GATT server: {}", e);
        }
        self.state = PeripheralState::Stopped;
        self.service = None;
        self.subscribers.clear();
        self.centrals.clear();
        self.tx_value = None;
    }

    /// Set the TX value and notify every subscriber.
    ///
    /// Succeeds if at least one subscriber accepted the value.
    pub async fn send_notification(&mut self, char_uuid: &str, value: Bytes) -> Result<()> {
        let uuid = parse_uuid(char_uuid)?;
        let tx_uuid = self
            .tx_uuid()
            .ok_or_else(|| Error::characteristic_not_found(uuid))?;
        if uuid != tx_uuid {
            return Err(Error::characteristic_not_found(uuid));
        }

        self.tx_value = Some(value.clone());
        if self.subscribers.is_empty() {
            return Err(Error::NoSubscribers);
        }

        let mut delivered = 0;
        for central in &self.subscribers {
            match self.backend.notify(central, tx_uuid, &value).await {
                Ok(true) => delivered += 1,
                Ok(false) => debug!("Notification to {} not accepted", central),
                Err(e) => warn!("Notification to {} failed: {}", central, e),
            }
        }

        if delivered == 0 {
            return Err(Error::NotificationRejected {
                attempted: self.subscribers.len(),
            });
        }
        debug!(
            "Notified {}/{} subscribers ({} bytes)",
            delivered,
            self.subscribers.len(),
            value.len()
        );
        Ok(())
    }

    /// Apply a callback from the GATT server.
    pub async fn handle_event(&mut self, event: ServerEvent, events: &mut EventMultiplexer) {
        if self.state == PeripheralState::Stopped {
            debug!("Ignoring server event while stopped: {:?}", event);
            return;
        }

        match event {
            ServerEvent::AdvertisingStarted => {
                if self.state == PeripheralState::Starting {
                    self.state = PeripheralState::Advertising;
                    info!("Advertising started");
                    events.emit(SessionEvent::AdvertisingStarted);
                    events.emit(SessionEvent::PeripheralStarted);
                }
            }
            ServerEvent::AdvertisingFailed { code } => {
                if self.state != PeripheralState::Starting {
                    debug!("Ignoring advertising failure {} while {:?}", code, self.state);
                    return;
                }
                warn!("Advertising failed with code {}", code);
                self.teardown().await;
                events.emit(SessionEvent::AdvertisingFailed { code });
            }
            ServerEvent::ConnectionChanged {
                central,
                name,
                connected,
            } => {
                if connected {
                    self.central_connected(central, name, events);
                } else {
                    self.central_disconnected(&central, events);
                }
            }
            ServerEvent::SubscriptionChanged {
                central,
                characteristic,
                subscribed,
            } => {
                if Some(characteristic) != self.tx_uuid() {
                    debug!("Ignoring subscription change on {}", characteristic);
                    return;
                }
                let synthesize = !self.backend.capabilities().server_connection_events;
                if subscribed {
                    if synthesize && !self.centrals.contains(&central) {
                        self.central_connected(central.clone(), None, events);
                    }
                    self.subscribe(central);
                } else if synthesize {
                    self.central_disconnected(&central, events);
                } else {
                    self.unsubscribe(&central);
                }
            }
            ServerEvent::DescriptorWrite {
                central,
                request,
                characteristic,
                descriptor,
                value,
                response_needed,
            } => {
                let is_tx_cccd = descriptor == CLIENT_CHARACTERISTIC_CONFIG
                    && Some(characteristic) == self.tx_uuid();
                let response = if is_tx_cccd {
                    let enable = value.first().is_some_and(|b| b & 0x03 != 0);
                    if enable {
                        self.subscribe(central.clone());
                    } else {
                        self.unsubscribe(&central);
                    }
                    AttResponse::success(0, value)
                } else {
                    debug!("Refusing write to descriptor {} of {}", descriptor, characteristic);
                    AttResponse::error(AttStatus::RequestNotSupported, 0)
                };
                if response_needed {
                    self.respond(&central, request, response).await;
                }
            }
            ServerEvent::CharacteristicWrite {
                central,
                request,
                characteristic,
                value,
                offset,
                response_needed,
            } => {
                let is_rx = self.service.is_some_and(|s| s.rx_uuid == characteristic);
                let response = if is_rx {
                    AttResponse::success(offset, value.clone())
                } else {
                    AttResponse::error(AttStatus::WriteNotPermitted, offset)
                };
                if response_needed {
                    self.respond(&central, request, response).await;
                }
                if is_rx {
                    debug!("RX {} bytes from {}", value.len(), central);
                    events.emit(SessionEvent::Rx {
                        char_uuid: characteristic,
                        value,
                        device_id: central,
                    });
                }
            }
            ServerEvent::ReadRequest {
                central,
                request,
                characteristic,
                offset,
            } => {
                let response = if Some(characteristic) != self.tx_uuid() {
                    AttResponse::error(AttStatus::ReadNotPermitted, offset)
                } else {
                    match &self.tx_value {
                        None => AttResponse::error(AttStatus::AttributeNotFound, offset),
                        Some(value) => match read_at_offset(value, offset) {
                            Ok(slice) => AttResponse::success(offset, slice),
                            Err(status) => AttResponse::error(status, offset),
                        },
                    }
                };
                self.respond(&central, request, response).await;
            }
            ServerEvent::MtuChanged { central, mtu } => {
                debug!("MTU for {} is now {}", central, mtu);
                events.emit(SessionEvent::MtuChanged {
                    device_id: central,
                    mtu,
                });
            }
        }
    }

    fn tx_uuid(&self) -> Option<Uuid> {
        self.service.map(|s| s.tx_uuid)
    }

    fn subscribe(&mut self, central: DeviceId) {
        self.centrals.insert(central.clone());
        if self.subscribers.insert(central.clone()) {
            info!("{} subscribed to notifications", central);
        }
    }

    fn unsubscribe(&mut self, central: &DeviceId) {
        if self.subscribers.remove(central) {
            info!("{} unsubscribed from notifications", central);
        }
    }

    fn central_connected(
        &mut self,
        central: DeviceId,
        name: Option<String>,
        events: &mut EventMultiplexer,
    ) {
        info!("Central connected: {}", central);
        self.centrals.insert(central.clone());
        events.emit(SessionEvent::ServerConnected {
            device_id: central,
            name: name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| self.unknown_name.clone()),
        });
    }

    fn central_disconnected(&mut self, central: &DeviceId, events: &mut EventMultiplexer) {
        info!("Central disconnected: {}", central);
        self.unsubscribe(central);
        self.centrals.remove(central);
        events.emit(SessionEvent::ServerDisconnected {
            device_id: central.clone(),
        });
    }

    async fn respond(&self, central: &DeviceId, request: RequestId, response: AttResponse) {
        if let Err(e) = self.backend.respond(central, request, response).await {
            warn!("Failed to answer request {:?} from {}: {}", request, central, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCapabilities;
    use crate::mock::{BackendCall, MockBackend};
    use gattbridge_types::uuids;

    const SERVICE: &str = "ffe0";
    const TX: &str = "ffe1";
    const RX: &str = "ffe2";

    fn tx() -> Uuid {
        uuids::from_short(0xffe1)
    }

    fn rx() -> Uuid {
        uuids::from_short(0xffe2)
    }

    fn central(id: &str) -> DeviceId {
        DeviceId::from(id)
    }

    async fn started(backend: Arc<MockBackend>) -> (PeripheralSession, EventMultiplexer) {
        let mut events = EventMultiplexer::new();
        let mut peripheral = PeripheralSession::new(backend, "Unknown");
        peripheral.start(SERVICE, TX, RX, &mut events).await.unwrap();
        peripheral
            .handle_event(ServerEvent::AdvertisingStarted, &mut events)
            .await;
        (peripheral, events)
    }

    fn cccd_write(id: &str, value: &'static [u8]) -> ServerEvent {
        ServerEvent::DescriptorWrite {
            central: central(id),
            request: RequestId(1),
            characteristic: tx(),
            descriptor: CLIENT_CHARACTERISTIC_CONFIG,
            value: Bytes::from_static(value),
            response_needed: true,
        }
    }

    // --- Lifecycle ---

    #[tokio::test]
    async fn test_start_emits_after_confirmation() {
        let backend = Arc::new(MockBackend::new());
        let mut events = EventMultiplexer::new();
        let mut stream = events.attach();
        let mut peripheral = PeripheralSession::new(backend.clone(), "Unknown");

        peripheral.start(SERVICE, TX, RX, &mut events).await.unwrap();
        assert_eq!(peripheral.state(), PeripheralState::Starting);
        assert!(stream.drain().is_empty());

        peripheral
            .handle_event(ServerEvent::AdvertisingStarted, &mut events)
            .await;
        assert_eq!(peripheral.state(), PeripheralState::Advertising);
        assert_eq!(
            stream.drain(),
            vec![SessionEvent::AdvertisingStarted, SessionEvent::PeripheralStarted]
        );

        let calls = backend.calls().await;
        assert!(matches!(calls[0], BackendCall::OpenServer(_)));
        assert_eq!(
            calls[1],
            BackendCall::StartAdvertising(uuids::from_short(0xffe0))
        );
    }

    #[tokio::test]
    async fn test_start_twice_is_already_running() {
        let (mut peripheral, mut events) = started(Arc::new(MockBackend::new())).await;
        let err = peripheral.start(SERVICE, TX, RX, &mut events).await;
        assert!(matches!(err, Err(Error::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_start_validates_before_hardware() {
        let backend = Arc::new(MockBackend::new());
        let mut events = EventMultiplexer::new();
        let mut peripheral = PeripheralSession::new(backend.clone(), "Unknown");

        let err = peripheral.start(SERVICE, "bogus", RX, &mut events).await;
        assert!(matches!(err, Err(Error::InvalidArgument(_))));
        assert!(backend.calls().await.is_empty());
        assert_eq!(peripheral.state(), PeripheralState::Stopped);
    }

    #[tokio::test]
    async fn test_start_bluetooth_off() {
        let backend = Arc::new(MockBackend::new());
        backend.set_powered(false);
        let mut events = EventMultiplexer::new();
        let mut peripheral = PeripheralSession::new(backend, "Unknown");

        let err = peripheral.start(SERVICE, TX, RX, &mut events).await;
        assert!(matches!(err, Err(Error::BluetoothOff)));
    }

    #[tokio::test]
    async fn test_start_unsupported_without_peripheral_role() {
        let caps = BackendCapabilities {
            peripheral_role: false,
            ..BackendCapabilities::FULL
        };
        let backend = Arc::new(MockBackend::builder().capabilities(caps).build());
        let mut events = EventMultiplexer::new();
        let mut peripheral = PeripheralSession::new(backend, "Unknown");

        let err = peripheral.start(SERVICE, TX, RX, &mut events).await;
        assert!(matches!(err, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_server_open_failure_emits_error() {
        let backend = Arc::new(MockBackend::builder().fail_open_server(true).build());
        let mut events = EventMultiplexer::new();
        let mut stream = events.attach();
        let mut peripheral = PeripheralSession::new(backend, "Unknown");

        let err = peripheral.start(SERVICE, TX, RX, &mut events).await;
        assert!(matches!(err, Err(Error::Backend { .. })));
        assert!(matches!(
            stream.drain().as_slice(),
            [SessionEvent::Error { message }] if message.contains("GATT server")
        ));
        assert_eq!(peripheral.state(), PeripheralState::Stopped);
    }

    #[tokio::test]
    async fn test_synchronous_advertising_failure() {
        let backend = Arc::new(MockBackend::builder().advertise_failure(3).build());
        let mut events = EventMultiplexer::new();
        let mut stream = events.attach();
        let mut peripheral = PeripheralSession::new(backend.clone(), "Unknown");

        let err = peripheral.start(SERVICE, TX, RX, &mut events).await;
        assert!(matches!(err, Err(Error::AdvertisingFailed { code: 3 })));
        assert_eq!(peripheral.state(), PeripheralState::Stopped);
        assert!(peripheral.service().is_none());
        assert_eq!(
            stream.drain(),
            vec![SessionEvent::AdvertisingFailed { code: 3 }]
        );
        assert!(backend.calls().await.contains(&BackendCall::CloseServer));
    }

    #[tokio::test]
    async fn test_asynchronous_advertising_failure() {
        let backend = Arc::new(MockBackend::new());
        let mut events = EventMultiplexer::new();
        let mut stream = events.attach();
        let mut peripheral = PeripheralSession::new(backend, "Unknown");
        peripheral.start(SERVICE, TX, RX, &mut events).await.unwrap();

        peripheral
            .handle_event(ServerEvent::AdvertisingFailed { code: 2 }, &mut events)
            .await;
        assert_eq!(peripheral.state(), PeripheralState::Stopped);
        assert!(peripheral.service().is_none());
        assert_eq!(
            stream.drain(),
            vec![SessionEvent::AdvertisingFailed { code: 2 }]
        );

        // Restartable afterwards.
        assert!(peripheral.start(SERVICE, TX, RX, &mut events).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_advertising_failure_keeps_running_session() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        peripheral.stop(&mut events).await;
        peripheral.start(SERVICE, TX, RX, &mut events).await.unwrap();
        peripheral
            .handle_event(ServerEvent::AdvertisingStarted, &mut events)
            .await;
        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        let mut stream = events.attach();

        peripheral
            .handle_event(ServerEvent::AdvertisingFailed { code: 3 }, &mut events)
            .await;

        assert_eq!(peripheral.state(), PeripheralState::Advertising);
        assert!(peripheral.service().is_some());
        assert!(peripheral.is_subscribed(&central("C1")));
        assert!(stream.drain().is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let backend = Arc::new(MockBackend::builder().fail_teardown(true).build());
        let (mut peripheral, mut events) = started(backend).await;
        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        let mut stream = events.attach();

        peripheral.stop(&mut events).await;
        peripheral.stop(&mut events).await;

        assert_eq!(peripheral.state(), PeripheralState::Stopped);
        assert!(peripheral.service().is_none());
        assert_eq!(peripheral.subscribers().count(), 0);
        assert_eq!(
            stream.drain(),
            vec![SessionEvent::PeripheralStopped, SessionEvent::PeripheralStopped]
        );
    }

    // --- Subscriptions and notifications ---

    #[tokio::test]
    async fn test_cccd_write_toggles_subscription() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;

        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        assert!(peripheral.is_subscribed(&central("C1")));
        assert_eq!(peripheral.subscribers().count(), 1);

        peripheral
            .handle_event(cccd_write("C1", &[0x00, 0x00]), &mut events)
            .await;
        assert!(!peripheral.is_subscribed(&central("C1")));

        let responses = backend
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Respond { response, .. } if response.status == AttStatus::Success))
            .count();
        assert_eq!(responses, 2);
    }

    #[tokio::test]
    async fn test_indication_cccd_subscribes() {
        let (mut peripheral, mut events) = started(Arc::new(MockBackend::new())).await;
        peripheral
            .handle_event(cccd_write("C1", &[0x02, 0x00]), &mut events)
            .await;
        assert!(peripheral.is_subscribed(&central("C1")));
    }

    #[tokio::test]
    async fn test_send_notification_without_subscribers() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        let mut stream = events.attach();

        let err = peripheral
            .send_notification(TX, Bytes::from_static(&[1]))
            .await;
        assert!(matches!(err, Err(Error::NoSubscribers)));
        assert!(stream.drain().is_empty());
        assert!(
            !backend
                .calls()
                .await
                .iter()
                .any(|c| matches!(c, BackendCall::Notify { .. }))
        );
    }

    #[tokio::test]
    async fn test_send_notification_wrong_characteristic() {
        let (mut peripheral, _events) = started(Arc::new(MockBackend::new())).await;
        let err = peripheral
            .send_notification(RX, Bytes::from_static(&[1]))
            .await;
        assert!(matches!(err, Err(Error::CharacteristicNotFound { uuid }) if uuid == rx()));
    }

    #[tokio::test]
    async fn test_send_notification_when_stopped() {
        let mut peripheral = PeripheralSession::new(Arc::new(MockBackend::new()), "Unknown");
        let err = peripheral
            .send_notification(TX, Bytes::from_static(&[1]))
            .await;
        assert!(matches!(err, Err(Error::CharacteristicNotFound { .. })));
    }

    #[tokio::test]
    async fn test_send_notification_at_least_one_delivery() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        peripheral
            .handle_event(cccd_write("C2", &[0x01, 0x00]), &mut events)
            .await;
        backend.reject_notifications_for(central("C2")).await;

        peripheral
            .send_notification(TX, Bytes::from_static(&[1, 2]))
            .await
            .unwrap();

        backend.reject_notifications_for(central("C1")).await;
        let err = peripheral
            .send_notification(TX, Bytes::from_static(&[3]))
            .await;
        assert!(matches!(err, Err(Error::NotificationRejected { attempted: 2 })));
    }

    #[tokio::test]
    async fn test_read_request_serves_tx_value_with_offset() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;

        let read = |offset| ServerEvent::ReadRequest {
            central: central("C1"),
            request: RequestId(7),
            characteristic: tx(),
            offset,
        };

        peripheral.handle_event(read(0), &mut events).await;
        // Value is retained even though nobody is subscribed.
        let _ = peripheral
            .send_notification(TX, Bytes::from_static(&[1, 2, 3]))
            .await;
        peripheral.handle_event(read(1), &mut events).await;
        peripheral.handle_event(read(4), &mut events).await;

        let responses: Vec<_> = backend
            .calls()
            .await
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::Respond { response, .. } => Some(response),
                _ => None,
            })
            .collect();
        assert_eq!(
            responses,
            vec![
                AttResponse::error(AttStatus::AttributeNotFound, 0),
                AttResponse::success(1, Bytes::from_static(&[2, 3])),
                AttResponse::error(AttStatus::InvalidOffset, 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_rx_write_emits_rx_event() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        let mut stream = events.attach();

        peripheral
            .handle_event(
                ServerEvent::CharacteristicWrite {
                    central: central("C1"),
                    request: RequestId(3),
                    characteristic: rx(),
                    value: Bytes::from_static(b"ping"),
                    offset: 0,
                    response_needed: false,
                },
                &mut events,
            )
            .await;

        assert_eq!(
            stream.drain(),
            vec![SessionEvent::Rx {
                char_uuid: rx(),
                value: Bytes::from_static(b"ping"),
                device_id: central("C1"),
            }]
        );
        assert!(
            !backend
                .calls()
                .await
                .iter()
                .any(|c| matches!(c, BackendCall::Respond { .. }))
        );
    }

    #[tokio::test]
    async fn test_unknown_descriptor_write_is_not_supported() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        backend.clear_calls().await;

        peripheral
            .handle_event(
                ServerEvent::DescriptorWrite {
                    central: central("C1"),
                    request: RequestId(4),
                    characteristic: tx(),
                    descriptor: uuids::from_short(0x2901),
                    value: Bytes::from_static(&[0x01, 0x00]),
                    response_needed: true,
                },
                &mut events,
            )
            .await;

        assert!(!peripheral.is_subscribed(&central("C1")));
        assert_eq!(
            backend.calls().await,
            vec![BackendCall::Respond {
                central: central("C1"),
                request: RequestId(4),
                response: AttResponse::error(AttStatus::RequestNotSupported, 0),
            }]
        );
    }

    #[tokio::test]
    async fn test_write_to_tx_is_refused() {
        let backend = Arc::new(MockBackend::new());
        let (mut peripheral, mut events) = started(backend.clone()).await;
        let mut stream = events.attach();

        peripheral
            .handle_event(
                ServerEvent::CharacteristicWrite {
                    central: central("C1"),
                    request: RequestId(4),
                    characteristic: tx(),
                    value: Bytes::from_static(b"x"),
                    offset: 0,
                    response_needed: true,
                },
                &mut events,
            )
            .await;

        assert!(stream.drain().is_empty());
        assert!(backend.calls().await.iter().any(|c| matches!(
            c,
            BackendCall::Respond { response, .. } if response.status == AttStatus::WriteNotPermitted
        )));
    }

    // --- Connection callbacks ---

    #[tokio::test]
    async fn test_disconnect_removes_subscriber() {
        let (mut peripheral, mut events) = started(Arc::new(MockBackend::new())).await;
        let mut stream = events.attach();

        peripheral
            .handle_event(
                ServerEvent::ConnectionChanged {
                    central: central("C1"),
                    name: Some("Phone".into()),
                    connected: true,
                },
                &mut events,
            )
            .await;
        assert!(!peripheral.is_subscribed(&central("C1")));
        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        peripheral
            .handle_event(
                ServerEvent::ConnectionChanged {
                    central: central("C1"),
                    name: None,
                    connected: false,
                },
                &mut events,
            )
            .await;

        assert!(!peripheral.is_subscribed(&central("C1")));
        assert_eq!(
            stream.drain(),
            vec![
                SessionEvent::ServerConnected {
                    device_id: central("C1"),
                    name: "Phone".into()
                },
                SessionEvent::ServerDisconnected {
                    device_id: central("C1")
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_subscription_synthesizes_connection_events() {
        let backend = Arc::new(
            MockBackend::builder()
                .capabilities(BackendCapabilities::IMPLICIT)
                .build(),
        );
        let (mut peripheral, mut events) = started(backend).await;
        let mut stream = events.attach();

        let change = |subscribed| ServerEvent::SubscriptionChanged {
            central: central("C1"),
            characteristic: tx(),
            subscribed,
        };
        peripheral.handle_event(change(true), &mut events).await;
        assert!(peripheral.is_subscribed(&central("C1")));
        peripheral.handle_event(change(false), &mut events).await;
        assert!(!peripheral.is_subscribed(&central("C1")));

        assert_eq!(
            stream.drain(),
            vec![
                SessionEvent::ServerConnected {
                    device_id: central("C1"),
                    name: "Unknown".into()
                },
                SessionEvent::ServerDisconnected {
                    device_id: central("C1")
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_server_mtu_change_is_reported() {
        let (mut peripheral, mut events) = started(Arc::new(MockBackend::new())).await;
        let mut stream = events.attach();
        peripheral
            .handle_event(
                ServerEvent::MtuChanged {
                    central: central("C1"),
                    mtu: 185,
                },
                &mut events,
            )
            .await;
        assert_eq!(
            stream.drain(),
            vec![SessionEvent::MtuChanged {
                device_id: central("C1"),
                mtu: 185
            }]
        );
    }

    #[tokio::test]
    async fn test_events_ignored_while_stopped() {
        let backend = Arc::new(MockBackend::new());
        let mut events = EventMultiplexer::new();
        let mut stream = events.attach();
        let mut peripheral = PeripheralSession::new(backend.clone(), "Unknown");

        peripheral
            .handle_event(cccd_write("C1", &[0x01, 0x00]), &mut events)
            .await;
        peripheral
            .handle_event(ServerEvent::AdvertisingStarted, &mut events)
            .await;

        assert!(!peripheral.is_subscribed(&central("C1")));
        assert!(stream.drain().is_empty());
        assert!(backend.calls().await.is_empty());
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Enable,
        Disable,
        Disconnect,
    }

    fn op() -> impl proptest::strategy::Strategy<Value = Op> {
        proptest::prop_oneof![
            proptest::strategy::Just(Op::Enable),
            proptest::strategy::Just(Op::Disable),
            proptest::strategy::Just(Op::Disconnect),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_subscriber_set_tracks_cccd_and_disconnects(
            ops in proptest::collection::vec((0u8..4, op()), 0..48)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (mut peripheral, mut events) = started(Arc::new(MockBackend::new())).await;
                let mut expected = HashSet::new();

                for (idx, op) in ops {
                    let id = format!("C{}", idx);
                    let event = match op {
                        Op::Enable => {
                            expected.insert(central(&id));
                            cccd_write(&id, &[0x01, 0x00])
                        }
                        Op::Disable => {
                            expected.remove(&central(&id));
                            cccd_write(&id, &[0x00, 0x00])
                        }
                        Op::Disconnect => {
                            expected.remove(&central(&id));
                            ServerEvent::ConnectionChanged {
                                central: central(&id),
                                name: None,
                                connected: false,
                            }
                        }
                    };
                    peripheral.handle_event(event, &mut events).await;

                    let actual: HashSet<DeviceId> = peripheral.subscribers().cloned().collect();
                    assert_eq!(actual, expected);
                }
            });
        }
    }
}
