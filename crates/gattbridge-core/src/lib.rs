//! Dual-role BLE GATT session manager.
//!
//! One [`Session`] lets a device act as a BLE peripheral (a GATT server
//! advertising one service with a TX and an RX characteristic) and as a BLE
//! central (scanning and holding any number of GATT client connections) at
//! the same time. Every asynchronous radio callback from either role is
//! funneled into one ordered stream of [`SessionEvent`]s.
//!
//! # Architecture
//!
//! - [`backend`]: the [`BleBackend`] trait a platform stack implements, and
//!   the channel its callbacks are pushed through.
//! - [`peripheral`]: the server role: advertising, subscribers, notifications.
//! - [`registry`]: the client role: one connection state machine per device.
//! - [`scan`]: scanner state and deduplicated sightings.
//! - [`events`]: the event type and the single-listener multiplexer.
//! - [`session`]: the task that owns all of the above, and its handle.
//!
//! # Platform Differences
//!
//! Stacks disagree on a few points. Instead of separate code paths, a backend
//! reports [`BackendCapabilities`] and the session adapts:
//!
//! | Capability | When absent |
//! |------------|-------------|
//! | `server_connection_events` | first subscription / last unsubscription stand in for `server_connected` / `server_disconnected` |
//! | `explicit_cccd_write` | subscribing only enables notifications; no descriptor write |
//! | `client_mtu_request` | `request_mtu` reports the current effective MTU instead |
//! | `peripheral_role` | `start_peripheral` fails with [`Error::Unsupported`] |
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use gattbridge_core::backend::hardware_channel;
//! use gattbridge_core::mock::MockBackend;
//! use gattbridge_core::{Session, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> gattbridge_core::Result<()> {
//!     let (sender, receiver) = hardware_channel();
//!     let backend = Arc::new(MockBackend::builder().events(sender).build());
//!     let session = Session::spawn(backend, receiver, SessionConfig::default())?;
//!     let mut events = session.subscribe_events().await?;
//!
//!     session.start_scan(None).await?;
//!     assert_eq!(events.recv().await, Some(SessionEvent::ScanStarted));
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod mock;
pub mod peripheral;
#[cfg(feature = "btleplug")]
pub mod platform;
pub mod registry;
pub mod scan;
pub mod session;

pub use backend::{
    BackendCapabilities, BackendError, BleBackend, HardwareEvent, HardwareEventReceiver,
    HardwareEventSender, LinkId, hardware_channel,
};
pub use config::{
    AutoSubscribe, CentralConfig, ConfigError, DiscoveryFailurePolicy, LoggingConfig, SessionConfig,
    ValidationError,
};
pub use error::{Error, Result};
pub use events::{EventStream, SessionEvent};
pub use logging::LogSwitch;
pub use mock::MockBackend;
#[cfg(feature = "btleplug")]
pub use platform::BtleplugBackend;
pub use session::{Session, SessionHandle};

// Re-export the shared value types.
pub use gattbridge_types::{
    AttStatus, CharacteristicProperties, DeviceId, DiscoveredCharacteristic, DiscoveredDevice,
    ServiceDescriptor, WriteType, uuids,
};
