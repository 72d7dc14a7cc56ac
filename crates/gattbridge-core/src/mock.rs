//! In-memory [`BleBackend`] for tests.
//!
//! [`MockBackend`] records every request it receives and can be told to
//! refuse specific ones. Given a [`HardwareEventSender`], it also answers
//! accepted requests the way a cooperative stack would (advertising
//! confirmed, links connected, services discovered, writes completed), so a
//! whole session can be driven without Bluetooth hardware.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use gattbridge_core::backend::hardware_channel;
//! use gattbridge_core::mock::MockBackend;
//!
//! let (sender, _receiver) = hardware_channel();
//! let backend = Arc::new(MockBackend::builder().events(sender).build());
//! backend.set_powered(false);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use uuid::Uuid;

use gattbridge_types::{
    CharacteristicProperties, DeviceId, DiscoveredCharacteristic, ServiceDescriptor, WriteType,
};

use crate::backend::{
    AttResponse, BackendCapabilities, BackendError, BackendResult, BleBackend, HardwareEvent,
    HardwareEventSender, LinkEvent, LinkId, RequestId, ServerEvent,
};

/// A request received by [`MockBackend`].
///
/// Queries (`is_powered`, `capabilities`, `resolve_device`,
/// `max_write_len`) are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    OpenServer(ServiceDescriptor),
    CloseServer,
    StartAdvertising(Uuid),
    StopAdvertising,
    Notify {
        central: DeviceId,
        characteristic: Uuid,
        value: Bytes,
    },
    Respond {
        central: DeviceId,
        request: RequestId,
        response: AttResponse,
    },
    StartScan(Option<Uuid>),
    StopScan,
    Connect(LinkId),
    Disconnect(LinkId),
    Release(LinkId),
    DiscoverServices(LinkId),
    SetNotify {
        link: LinkId,
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        link: LinkId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
    },
    WriteCharacteristic {
        link: LinkId,
        characteristic: Uuid,
        value: Bytes,
        write_type: WriteType,
    },
    RequestMtu {
        link: LinkId,
        mtu: u16,
    },
}

/// A scriptable Bluetooth stack.
pub struct MockBackend {
    capabilities: BackendCapabilities,
    powered: AtomicBool,
    fail_open_server: AtomicBool,
    advertise_failure: Option<i32>,
    fail_teardown: AtomicBool,
    fail_scan: AtomicBool,
    fail_connect: AtomicBool,
    fail_write: AtomicBool,
    fail_mtu: AtomicBool,
    /// `None` resolves every device id.
    known_devices: Option<HashSet<DeviceId>>,
    services: Vec<DiscoveredCharacteristic>,
    max_write_len: Option<u16>,
    rejected_centrals: RwLock<HashSet<DeviceId>>,
    /// Characteristics of the open GATT server.
    server: RwLock<HashMap<Uuid, CharacteristicProperties>>,
    /// Most recent link per device passed to `connect`.
    links: RwLock<HashMap<DeviceId, LinkId>>,
    calls: RwLock<Vec<BackendCall>>,
    events: Option<HardwareEventSender>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("capabilities", &self.capabilities)
            .field("powered", &self.powered.load(Ordering::Relaxed))
            .field("services", &self.services.len())
            .field("answers_requests", &self.events.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockBackend {
    /// A powered stack with every capability that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    /// Flip the adapter power state seen by `is_powered`.
    ///
    /// This does not push an adapter event; send one through the
    /// hardware channel when the session should observe the change.
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn set_fail_scan(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.fail_write.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mtu(&self, fail: bool) {
        self.fail_mtu.store(fail, Ordering::SeqCst);
    }

    /// Make `notify` report `Ok(false)` for `central`.
    pub async fn reject_notifications_for(&self, central: DeviceId) {
        self.rejected_centrals.write().await.insert(central);
    }

    /// Every recorded request, oldest first.
    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.read().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.write().await.clear();
    }

    /// Properties of `characteristic` in the open GATT server.
    pub async fn server_characteristic(&self, characteristic: Uuid) -> Option<CharacteristicProperties> {
        self.server.read().await.get(&characteristic).copied()
    }

    /// The link of the latest `connect` to `device`.
    pub async fn link_for(&self, device: &DeviceId) -> Option<LinkId> {
        self.links.read().await.get(device).cloned()
    }

    async fn record(&self, call: BackendCall) {
        self.calls.write().await.push(call);
    }

    fn answer(&self, event: impl Into<HardwareEvent>) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }

    fn refused(flag: &AtomicBool, what: &str) -> BackendResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(BackendError::Rejected(format!("mock refused {}", what)))
        } else {
            Ok(())
        }
    }
}

/// A random MAC-style device id.
pub fn random_device_id() -> DeviceId {
    let bytes: [u8; 6] = rand::random();
    let parts: Vec<String> = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    DeviceId::new(parts.join(":"))
}

#[async_trait]
impl BleBackend for MockBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn open_server(&self, service: &ServiceDescriptor) -> BackendResult<()> {
        self.record(BackendCall::OpenServer(*service)).await;
        if self.fail_open_server.load(Ordering::SeqCst) {
            return Err(BackendError::Platform("mock server unavailable".into()));
        }
        let mut server = self.server.write().await;
        server.clear();
        server.insert(service.tx_uuid, service.tx_properties());
        server.insert(service.rx_uuid, service.rx_properties());
        Ok(())
    }

    async fn close_server(&self) -> BackendResult<()> {
        self.record(BackendCall::CloseServer).await;
        self.server.write().await.clear();
        Self::refused(&self.fail_teardown, "close_server")
    }

    async fn start_advertising(&self, service_uuid: Uuid) -> BackendResult<()> {
        self.record(BackendCall::StartAdvertising(service_uuid)).await;
        if let Some(code) = self.advertise_failure {
            return Err(BackendError::Advertising { code });
        }
        self.answer(ServerEvent::AdvertisingStarted);
        Ok(())
    }

    async fn stop_advertising(&self) -> BackendResult<()> {
        self.record(BackendCall::StopAdvertising).await;
        Self::refused(&self.fail_teardown, "stop_advertising")
    }

    async fn notify(
        &self,
        central: &DeviceId,
        characteristic: Uuid,
        value: &Bytes,
    ) -> BackendResult<bool> {
        self.record(BackendCall::Notify {
            central: central.clone(),
            characteristic,
            value: value.clone(),
        })
        .await;
        let notifiable = self
            .server_characteristic(characteristic)
            .await
            .is_some_and(|p| p.contains(CharacteristicProperties::NOTIFY));
        if !notifiable {
            return Err(BackendError::Rejected(format!(
                "{} is not a notifiable server characteristic",
                characteristic
            )));
        }
        Ok(!self.rejected_centrals.read().await.contains(central))
    }

    async fn respond(
        &self,
        central: &DeviceId,
        request: RequestId,
        response: AttResponse,
    ) -> BackendResult<()> {
        self.record(BackendCall::Respond {
            central: central.clone(),
            request,
            response,
        })
        .await;
        Ok(())
    }

    async fn start_scan(&self, service_filter: Option<Uuid>) -> BackendResult<()> {
        self.record(BackendCall::StartScan(service_filter)).await;
        Self::refused(&self.fail_scan, "start_scan")
    }

    async fn stop_scan(&self) -> BackendResult<()> {
        self.record(BackendCall::StopScan).await;
        Self::refused(&self.fail_teardown, "stop_scan")
    }

    async fn resolve_device(&self, device: &DeviceId) -> BackendResult<()> {
        match &self.known_devices {
            Some(known) if !known.contains(device) => {
                Err(BackendError::DeviceNotFound(device.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn connect(&self, link: &LinkId) -> BackendResult<()> {
        self.record(BackendCall::Connect(link.clone())).await;
        self.links
            .write()
            .await
            .insert(link.device.clone(), link.clone());
        Self::refused(&self.fail_connect, "connect")?;
        self.answer(LinkEvent::Connected { link: link.clone() });
        Ok(())
    }

    async fn disconnect(&self, link: &LinkId) -> BackendResult<()> {
        self.record(BackendCall::Disconnect(link.clone())).await;
        Self::refused(&self.fail_teardown, "disconnect")?;
        self.answer(LinkEvent::Disconnected {
            link: link.clone(),
            status: 0,
        });
        Ok(())
    }

    async fn release(&self, link: &LinkId) {
        self.record(BackendCall::Release(link.clone())).await;
    }

    async fn discover_services(&self, link: &LinkId) -> BackendResult<()> {
        self.record(BackendCall::DiscoverServices(link.clone())).await;
        self.answer(LinkEvent::ServicesDiscovered {
            link: link.clone(),
            characteristics: self.services.clone(),
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        enable: bool,
    ) -> BackendResult<()> {
        self.record(BackendCall::SetNotify {
            link: link.clone(),
            characteristic: characteristic.uuid,
            enable,
        })
        .await;
        Ok(())
    }

    async fn write_descriptor(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        descriptor: Uuid,
        value: Bytes,
    ) -> BackendResult<()> {
        self.record(BackendCall::WriteDescriptor {
            link: link.clone(),
            characteristic: characteristic.uuid,
            descriptor,
            value,
        })
        .await;
        Ok(())
    }

    async fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> BackendResult<()> {
        self.record(BackendCall::WriteCharacteristic {
            link: link.clone(),
            characteristic: characteristic.uuid,
            value,
            write_type,
        })
        .await;
        Self::refused(&self.fail_write, "write")?;
        self.answer(LinkEvent::WriteCompleted {
            link: link.clone(),
            characteristic: characteristic.uuid,
            status: 0,
        });
        Ok(())
    }

    async fn request_mtu(&self, link: &LinkId, mtu: u16) -> BackendResult<()> {
        self.record(BackendCall::RequestMtu {
            link: link.clone(),
            mtu,
        })
        .await;
        Self::refused(&self.fail_mtu, "request_mtu")?;
        self.answer(LinkEvent::MtuChanged {
            link: link.clone(),
            mtu,
            status: 0,
        });
        Ok(())
    }

    async fn max_write_len(&self, _link: &LinkId, _write_type: WriteType) -> Option<u16> {
        self.max_write_len
    }
}

/// Builder for [`MockBackend`].
#[derive(Debug)]
pub struct MockBackendBuilder {
    capabilities: BackendCapabilities,
    powered: bool,
    fail_open_server: bool,
    advertise_failure: Option<i32>,
    fail_teardown: bool,
    known_devices: Option<HashSet<DeviceId>>,
    services: Vec<DiscoveredCharacteristic>,
    max_write_len: Option<u16>,
    events: Option<HardwareEventSender>,
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self {
            capabilities: BackendCapabilities::FULL,
            powered: true,
            fail_open_server: false,
            advertise_failure: None,
            fail_teardown: false,
            known_devices: None,
            services: Vec::new(),
            max_write_len: None,
            events: None,
        }
    }
}

impl MockBackendBuilder {
    #[must_use]
    pub fn capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn powered(mut self, powered: bool) -> Self {
        self.powered = powered;
        self
    }

    #[must_use]
    pub fn fail_open_server(mut self, fail: bool) -> Self {
        self.fail_open_server = fail;
        self
    }

    /// Refuse `start_advertising` with this platform code.
    #[must_use]
    pub fn advertise_failure(mut self, code: i32) -> Self {
        self.advertise_failure = Some(code);
        self
    }

    /// Make `stop_advertising`, `close_server`, `stop_scan` and `disconnect` fail.
    #[must_use]
    pub fn fail_teardown(mut self, fail: bool) -> Self {
        self.fail_teardown = fail;
        self
    }

    /// Only these devices resolve; others are `DeviceNotFound`.
    #[must_use]
    pub fn known_devices<I, D>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        self.known_devices = Some(devices.into_iter().map(Into::into).collect());
        self
    }

    /// Characteristics reported by service discovery on every device.
    #[must_use]
    pub fn services(mut self, characteristics: Vec<DiscoveredCharacteristic>) -> Self {
        self.services = characteristics;
        self
    }

    #[must_use]
    pub fn max_write_len(mut self, len: u16) -> Self {
        self.max_write_len = Some(len);
        self
    }

    /// Answer accepted requests through `sender`.
    #[must_use]
    pub fn events(mut self, sender: HardwareEventSender) -> Self {
        self.events = Some(sender);
        self
    }

    #[must_use]
    pub fn build(self) -> MockBackend {
        MockBackend {
            capabilities: self.capabilities,
            powered: AtomicBool::new(self.powered),
            fail_open_server: AtomicBool::new(self.fail_open_server),
            advertise_failure: self.advertise_failure,
            fail_teardown: AtomicBool::new(self.fail_teardown),
            fail_scan: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
            fail_mtu: AtomicBool::new(false),
            known_devices: self.known_devices,
            services: self.services,
            max_write_len: self.max_write_len,
            rejected_centrals: RwLock::new(HashSet::new()),
            server: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            events: self.events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::hardware_channel;
    use gattbridge_types::uuids;

    #[tokio::test]
    async fn test_records_requests_in_order() {
        let backend = MockBackend::new();
        backend.start_scan(None).await.unwrap();
        backend.stop_scan().await.unwrap();
        assert!(backend.is_powered().await);
        assert_eq!(
            backend.calls().await,
            vec![BackendCall::StartScan(None), BackendCall::StopScan]
        );

        backend.clear_calls().await;
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_server_table_follows_open_and_close() {
        let backend = MockBackend::new();
        let service = ServiceDescriptor::parse("ffe0", "ffe1", "ffe2").unwrap();
        let central = DeviceId::from("C1");
        let value = Bytes::from_static(b"hi");

        assert!(backend.notify(&central, service.tx_uuid, &value).await.is_err());

        backend.open_server(&service).await.unwrap();
        let tx = backend.server_characteristic(service.tx_uuid).await.unwrap();
        assert!(tx.contains(CharacteristicProperties::NOTIFY));
        let rx = backend.server_characteristic(service.rx_uuid).await.unwrap();
        assert!(rx.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE));
        assert!(backend.notify(&central, service.tx_uuid, &value).await.unwrap());
        assert!(backend.notify(&central, service.rx_uuid, &value).await.is_err());

        backend.close_server().await.unwrap();
        assert!(backend.server_characteristic(service.tx_uuid).await.is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let backend = MockBackend::builder().advertise_failure(7).build();
        assert_eq!(
            backend.start_advertising(uuids::from_short(0x180d)).await,
            Err(BackendError::Advertising { code: 7 })
        );

        backend.set_fail_scan(true);
        assert!(backend.start_scan(None).await.is_err());
        backend.set_fail_scan(false);
        assert!(backend.start_scan(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_known_devices() {
        let backend = MockBackend::builder().known_devices(["AA:BB"]).build();
        assert!(backend.resolve_device(&DeviceId::from("AA:BB")).await.is_ok());
        assert_eq!(
            backend.resolve_device(&DeviceId::from("CC:DD")).await,
            Err(BackendError::DeviceNotFound("CC:DD".into()))
        );
    }

    #[tokio::test]
    async fn test_answers_through_hardware_channel() {
        let (sender, mut receiver) = hardware_channel();
        let characteristic = DiscoveredCharacteristic::new(
            uuids::from_short(0x180d),
            uuids::from_short(0x2a37),
            CharacteristicProperties::NOTIFY,
        );
        let backend = MockBackend::builder()
            .events(sender)
            .services(vec![characteristic])
            .build();
        let link = LinkId::new(DeviceId::from("AA:BB"), 1);

        backend.connect(&link).await.unwrap();
        backend.discover_services(&link).await.unwrap();

        assert_eq!(
            receiver.recv().await,
            Some(HardwareEvent::Link(LinkEvent::Connected { link: link.clone() }))
        );
        assert_eq!(
            receiver.recv().await,
            Some(HardwareEvent::Link(LinkEvent::ServicesDiscovered {
                link: link.clone(),
                characteristics: vec![characteristic],
            }))
        );
        assert_eq!(backend.link_for(&link.device).await, Some(link));
    }

    #[tokio::test]
    async fn test_rejected_notifications() {
        let backend = MockBackend::new();
        let service = ServiceDescriptor::parse("ffe0", "ffe1", "ffe2").unwrap();
        backend.open_server(&service).await.unwrap();
        let central = DeviceId::from("C1");
        let value = Bytes::from_static(b"x");
        assert_eq!(backend.notify(&central, service.tx_uuid, &value).await, Ok(true));

        backend.reject_notifications_for(central.clone()).await;
        assert_eq!(backend.notify(&central, service.tx_uuid, &value).await, Ok(false));
    }

    #[test]
    fn test_random_device_id_shape() {
        let id = random_device_id();
        assert_eq!(id.as_str().len(), 17);
        assert_eq!(id.as_str().matches(':').count(), 5);
    }
}
