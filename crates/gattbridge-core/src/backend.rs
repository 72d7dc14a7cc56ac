//! The boundary between the session and a platform Bluetooth stack.
//!
//! A [`BleBackend`] only *issues* requests. Each method returns as soon as
//! the stack has accepted (or refused) the request; the outcome arrives
//! later as a [`HardwareEvent`] pushed through a [`HardwareEventSender`].
//! Platform glue keeps the sender and calls it from whatever thread the
//! stack delivers callbacks on; the session task owns the receiver and
//! applies events one at a time.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use gattbridge_types::{AttStatus, DeviceId, DiscoveredCharacteristic, ServiceDescriptor, WriteType};

/// Errors a backend reports while issuing a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Adapter missing or powered off.
    #[error("Bluetooth adapter unavailable")]
    Unavailable,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The stack refused to start advertising.
    #[error("Advertising refused with code {code}")]
    Advertising { code: i32 },

    #[error("Unsupported by this platform: {0}")]
    Unsupported(&'static str),

    /// The stack refused to queue the request (busy, link gone, ...).
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Key of one connection attempt to a remote device.
///
/// The generation increases with every `connect`, so callbacks belonging to
/// an attempt that has since been torn down can be told apart from those of
/// a newer attempt to the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub device: DeviceId,
    pub generation: u64,
}

impl LinkId {
    pub fn new(device: DeviceId, generation: u64) -> Self {
        Self { device, generation }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.device, self.generation)
    }
}

/// Correlates a server-side ATT request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Answer to an ATT read or write request received by the GATT server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttResponse {
    pub status: AttStatus,
    pub offset: usize,
    pub value: Bytes,
}

impl AttResponse {
    pub fn success(offset: usize, value: Bytes) -> Self {
        Self {
            status: AttStatus::Success,
            offset,
            value,
        }
    }

    pub fn error(status: AttStatus, offset: usize) -> Self {
        Self {
            status,
            offset,
            value: Bytes::new(),
        }
    }
}

/// What a platform stack can and cannot do.
///
/// Each flag selects one branch where the stacks diverge, so the session
/// logic stays a single state machine per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// The stack can host a GATT server and advertise.
    pub peripheral_role: bool,
    /// The server reports central connect/disconnect. When `false`, first
    /// subscription and unsubscription stand in for them.
    pub server_connection_events: bool,
    /// Enabling notifications requires an explicit write of the CCCD.
    pub explicit_cccd_write: bool,
    /// The client may start an MTU exchange.
    pub client_mtu_request: bool,
}

impl BackendCapabilities {
    /// A stack that does everything explicitly (Android style).
    pub const FULL: Self = Self {
        peripheral_role: true,
        server_connection_events: true,
        explicit_cccd_write: true,
        client_mtu_request: true,
    };

    /// A stack that negotiates MTU and CCCDs itself and has no server
    /// connection callbacks (CoreBluetooth style).
    pub const IMPLICIT: Self = Self {
        peripheral_role: true,
        server_connection_events: false,
        explicit_cccd_write: false,
        client_mtu_request: false,
    };
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self::FULL
    }
}

/// Request primitives of a platform Bluetooth stack.
///
/// Implementations must not block: every method hands the request to the
/// stack and returns. The session awaits these calls inline, so a slow
/// implementation delays every other command.
#[async_trait]
pub trait BleBackend: Send + Sync + 'static {
    fn capabilities(&self) -> BackendCapabilities;

    async fn is_powered(&self) -> bool;

    // --- GATT server ---

    /// Register the service with its TX (notify+read) and RX (write) characteristics.
    async fn open_server(&self, service: &ServiceDescriptor) -> BackendResult<()>;

    async fn close_server(&self) -> BackendResult<()>;

    async fn start_advertising(&self, service_uuid: Uuid) -> BackendResult<()>;

    async fn stop_advertising(&self) -> BackendResult<()>;

    /// Queue a notification; `Ok(false)` means the stack refused this central.
    async fn notify(
        &self,
        central: &DeviceId,
        characteristic: Uuid,
        value: &Bytes,
    ) -> BackendResult<bool>;

    async fn respond(
        &self,
        central: &DeviceId,
        request: RequestId,
        response: AttResponse,
    ) -> BackendResult<()>;

    // --- Scanning ---

    async fn start_scan(&self, service_filter: Option<Uuid>) -> BackendResult<()>;

    async fn stop_scan(&self) -> BackendResult<()>;

    // --- GATT client ---

    /// Check that the stack can address `device`.
    async fn resolve_device(&self, device: &DeviceId) -> BackendResult<()>;

    async fn connect(&self, link: &LinkId) -> BackendResult<()>;

    async fn disconnect(&self, link: &LinkId) -> BackendResult<()>;

    /// Drop every platform handle held for `link`. Infallible by contract.
    async fn release(&self, link: &LinkId);

    async fn discover_services(&self, link: &LinkId) -> BackendResult<()>;

    async fn set_notify(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        enable: bool,
    ) -> BackendResult<()>;

    async fn write_descriptor(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        descriptor: Uuid,
        value: Bytes,
    ) -> BackendResult<()>;

    async fn write_characteristic(
        &self,
        link: &LinkId,
        characteristic: &DiscoveredCharacteristic,
        value: Bytes,
        write_type: WriteType,
    ) -> BackendResult<()>;

    async fn request_mtu(&self, link: &LinkId, mtu: u16) -> BackendResult<()>;

    /// Largest single write currently possible on `link`, if the stack knows it.
    async fn max_write_len(&self, link: &LinkId, write_type: WriteType) -> Option<u16>;
}

/// Callbacks from the GATT server role.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AdvertisingStarted,
    AdvertisingFailed {
        code: i32,
    },
    ConnectionChanged {
        central: DeviceId,
        name: Option<String>,
        connected: bool,
    },
    /// The stack tracked the CCCD itself and reports the resulting state.
    SubscriptionChanged {
        central: DeviceId,
        characteristic: Uuid,
        subscribed: bool,
    },
    DescriptorWrite {
        central: DeviceId,
        request: RequestId,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Bytes,
        response_needed: bool,
    },
    CharacteristicWrite {
        central: DeviceId,
        request: RequestId,
        characteristic: Uuid,
        value: Bytes,
        offset: usize,
        response_needed: bool,
    },
    ReadRequest {
        central: DeviceId,
        request: RequestId,
        characteristic: Uuid,
        offset: usize,
    },
    MtuChanged {
        central: DeviceId,
        mtu: u16,
    },
}

/// Callbacks from the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Result {
        device: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    Failed {
        code: i32,
    },
}

/// Callbacks from one GATT client link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected {
        link: LinkId,
    },
    ConnectFailed {
        link: LinkId,
        message: String,
    },
    Disconnected {
        link: LinkId,
        status: i32,
    },
    ServicesDiscovered {
        link: LinkId,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    DiscoveryFailed {
        link: LinkId,
        status: i32,
    },
    ValueChanged {
        link: LinkId,
        characteristic: Uuid,
        value: Bytes,
    },
    WriteCompleted {
        link: LinkId,
        characteristic: Uuid,
        status: i32,
    },
    WriteFailed {
        link: LinkId,
        characteristic: Uuid,
        message: String,
    },
    /// `status` 0 is success; anything else is a platform failure code.
    MtuChanged {
        link: LinkId,
        mtu: u16,
        status: i32,
    },
}

impl LinkEvent {
    pub fn link(&self) -> &LinkId {
        match self {
            LinkEvent::Connected { link }
            | LinkEvent::ConnectFailed { link, .. }
            | LinkEvent::Disconnected { link, .. }
            | LinkEvent::ServicesDiscovered { link, .. }
            | LinkEvent::DiscoveryFailed { link, .. }
            | LinkEvent::ValueChanged { link, .. }
            | LinkEvent::WriteCompleted { link, .. }
            | LinkEvent::WriteFailed { link, .. }
            | LinkEvent::MtuChanged { link, .. } => link,
        }
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::Connected { .. } => "connected",
            LinkEvent::ConnectFailed { .. } => "connect_failed",
            LinkEvent::Disconnected { .. } => "disconnected",
            LinkEvent::ServicesDiscovered { .. } => "services_discovered",
            LinkEvent::DiscoveryFailed { .. } => "discovery_failed",
            LinkEvent::ValueChanged { .. } => "value_changed",
            LinkEvent::WriteCompleted { .. } => "write_completed",
            LinkEvent::WriteFailed { .. } => "write_failed",
            LinkEvent::MtuChanged { .. } => "mtu_changed",
        }
    }
}

/// Any callback from the platform stack, routed by role.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    AdapterState { powered: bool },
    Server(ServerEvent),
    Scan(ScanEvent),
    Link(LinkEvent),
}

impl From<ServerEvent> for HardwareEvent {
    fn from(event: ServerEvent) -> Self {
        HardwareEvent::Server(event)
    }
}

impl From<ScanEvent> for HardwareEvent {
    fn from(event: ScanEvent) -> Self {
        HardwareEvent::Scan(event)
    }
}

impl From<LinkEvent> for HardwareEvent {
    fn from(event: LinkEvent) -> Self {
        HardwareEvent::Link(event)
    }
}

/// Producer half of the hardware callback channel.
///
/// Unbounded: a callback must never block or be dropped because the session
/// is busy. Cheap to clone and usable from any thread.
#[derive(Debug, Clone)]
pub struct HardwareEventSender {
    tx: mpsc::UnboundedSender<HardwareEvent>,
}

impl HardwareEventSender {
    /// Push a callback. Returns `false` once the session has shut down.
    pub fn send(&self, event: impl Into<HardwareEvent>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn adapter_state(&self, powered: bool) -> bool {
        self.send(HardwareEvent::AdapterState { powered })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the hardware callback channel, owned by the session.
#[derive(Debug)]
pub struct HardwareEventReceiver {
    rx: mpsc::UnboundedReceiver<HardwareEvent>,
}

impl HardwareEventReceiver {
    pub async fn recv(&mut self) -> Option<HardwareEvent> {
        self.rx.recv().await
    }
}

/// Create the channel platform callbacks are funneled through.
pub fn hardware_channel() -> (HardwareEventSender, HardwareEventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HardwareEventSender { tx }, HardwareEventReceiver { rx })
}
