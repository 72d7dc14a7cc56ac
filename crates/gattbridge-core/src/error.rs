//! Error types for gattbridge-core.
//!
//! Every command on a [`crate::SessionHandle`] either completes immediately
//! or fails with one of these errors. Failures the radio reports *later*
//! never surface here; they arrive as [`crate::SessionEvent`]s instead.
//!
//! | Category | Variants | Raised |
//! |----------|----------|--------|
//! | Validation | [`Error::InvalidArgument`], [`Error::InvalidConfig`] | before any hardware call |
//! | Precondition | [`Error::BluetoothOff`], [`Error::AlreadyRunning`], [`Error::AlreadyConnected`], [`Error::NotConnected`], [`Error::CharacteristicNotFound`], [`Error::NoSubscribers`], [`Error::Unsupported`] | from in-memory state |
//! | Submission | [`Error::AdvertisingFailed`], [`Error::NotificationRejected`], [`Error::WriteRejected`], [`Error::MtuRequestRejected`], [`Error::DeviceNotFound`] | the radio refused to take the request |
//! | Platform | [`Error::Backend`], [`Error::SessionClosed`] | anything else |
//!
//! Teardown commands (`stop_peripheral`, `stop_scan`, `disconnect`,
//! `disconnect_all`, `stop_all`) never return an error.

use thiserror::Error;
use uuid::Uuid;

use gattbridge_types::{DeviceId, ParseError};

use crate::backend::BackendError;

/// Errors returned by session commands.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A UUID or device identifier could not be parsed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ParseError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The Bluetooth adapter is missing or powered off.
    #[error("Bluetooth is off")]
    BluetoothOff,

    /// `start_peripheral` while a peripheral session is already starting or advertising.
    #[error("Peripheral already running")]
    AlreadyRunning,

    /// The characteristic is not the TX characteristic, or was not discovered on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: Uuid },

    /// No central is subscribed to the TX characteristic.
    #[error("No subscribers")]
    NoSubscribers,

    /// Every subscriber refused the notification.
    #[error("Notification rejected by all {attempted} subscriber(s)")]
    NotificationRejected { attempted: usize },

    /// The device could not be resolved by the Bluetooth stack.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// A connection entry already exists for this device.
    #[error("Already connected to {0}")]
    AlreadyConnected(DeviceId),

    /// There is no established connection to this device.
    #[error("Not connected to {0}")]
    NotConnected(DeviceId),

    /// The platform cannot perform this operation.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// The radio refused to start advertising.
    #[error("Advertising failed with code {code}")]
    AdvertisingFailed { code: i32 },

    /// The radio refused to queue a characteristic write.
    #[error("Write to {uuid} on {device_id} failed: {reason}")]
    WriteRejected {
        device_id: DeviceId,
        uuid: Uuid,
        reason: String,
    },

    /// The radio refused to queue an MTU exchange.
    #[error("MTU request for {device_id} failed: {reason}")]
    MtuRequestRejected { device_id: DeviceId, reason: String },

    /// Any other fault reported by the Bluetooth stack.
    #[error("Bluetooth error during {operation}: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },

    /// The session task has shut down.
    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: Uuid) -> Self {
        Self::CharacteristicNotFound { uuid }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Classify a synchronous backend refusal.
    pub fn from_backend(operation: &'static str, err: BackendError) -> Self {
        match err {
            BackendError::Unavailable => Self::BluetoothOff,
            BackendError::DeviceNotFound(id) => Self::DeviceNotFound(DeviceId::new(id)),
            BackendError::Unsupported(what) => Self::Unsupported(what.to_string()),
            BackendError::Advertising { code } => Self::AdvertisingFailed { code },
            source => Self::Backend { operation, source },
        }
    }

    /// Stable error code reported to the application across the call boundary.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::BluetoothOff => "BLUETOOTH_OFF",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::CharacteristicNotFound { .. } => "CHARACTERISTIC_NOT_FOUND",
            Self::NoSubscribers => "NO_SUBSCRIBERS",
            Self::NotificationRejected { .. } => "NOTIFICATION_FAILED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::AlreadyConnected(_) => "ALREADY_CONNECTED",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Unsupported(_) => "NOT_SUPPORTED",
            Self::AdvertisingFailed { .. } => "ADVERTISING_FAILED",
            Self::WriteRejected { .. } => "WRITE_FAILED",
            Self::MtuRequestRejected { .. } => "MTU_REQUEST_FAILED",
            Self::Backend { .. } => "BLUETOOTH_ERROR",
            Self::SessionClosed => "SESSION_CLOSED",
        }
    }
}

/// Result type alias using gattbridge-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected(DeviceId::from("AA:BB"));
        assert_eq!(err.to_string(), "Not connected to AA:BB");

        let err = Error::AdvertisingFailed { code: 3 };
        assert_eq!(err.to_string(), "Advertising failed with code 3");

        let err = Error::NotificationRejected { attempted: 2 };
        assert!(err.to_string().contains("2 subscriber"));
    }

    #[test]
    fn test_parse_error_converts() {
        let err: Error = ParseError::InvalidUuid("zz".into()).into();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_from_backend_classification() {
        assert!(matches!(
            Error::from_backend("connect", BackendError::Unavailable),
            Error::BluetoothOff
        ));
        assert!(matches!(
            Error::from_backend("resolve_device", BackendError::DeviceNotFound("AA:BB".into())),
            Error::DeviceNotFound(id) if id.as_str() == "AA:BB"
        ));
        assert!(matches!(
            Error::from_backend("start_advertising", BackendError::Advertising { code: 1 }),
            Error::AdvertisingFailed { code: 1 }
        ));
        assert!(matches!(
            Error::from_backend("request_mtu", BackendError::Unsupported("mtu")),
            Error::Unsupported(_)
        ));

        let err = Error::from_backend("connect", BackendError::Platform("gatt 133".into()));
        assert_eq!(err.code(), "BLUETOOTH_ERROR");
        assert!(err.to_string().contains("connect"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::BluetoothOff.code(), "BLUETOOTH_OFF");
        assert_eq!(Error::NoSubscribers.code(), "NO_SUBSCRIBERS");
        assert_eq!(
            Error::AlreadyConnected(DeviceId::from("x")).code(),
            "ALREADY_CONNECTED"
        );
        assert_eq!(
            Error::characteristic_not_found(Uuid::nil()).code(),
            "CHARACTERISTIC_NOT_FOUND"
        );
        assert_eq!(Error::unsupported("mtu").code(), "NOT_SUPPORTED");
        assert_eq!(Error::SessionClosed.code(), "SESSION_CLOSED");
    }
}
