//! Core value types shared by both GATT roles.

use core::fmt;
use std::borrow::Borrow;

use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::uuid::{ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, parse_uuid};

// --- ATT sizing ---

/// Default ATT MTU before any negotiation.
pub const MIN_ATT_MTU: u16 = 23;

/// Largest ATT MTU a link may negotiate.
pub const MAX_ATT_MTU: u16 = 517;

/// Bytes of ATT header preceding a write or notification payload.
pub const ATT_HEADER_LEN: u16 = 3;

/// Opaque, stable identifier of a remote radio.
///
/// On most stacks this is the MAC address; where the stack hides addresses
/// it is the platform's peripheral identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an identifier without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validate and wrap a caller-supplied identifier.
    pub fn parse(id: &str) -> ParseResult<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(ParseError::InvalidDeviceId(id.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The single service a peripheral session exposes.
///
/// TX is notify+read (server to client), RX is write+write-without-response
/// (client to server).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ServiceDescriptor {
    pub service_uuid: Uuid,
    pub tx_uuid: Uuid,
    pub rx_uuid: Uuid,
}

impl ServiceDescriptor {
    /// Parse the three UUID strings of a service definition.
    pub fn parse(service: &str, tx: &str, rx: &str) -> ParseResult<Self> {
        Ok(Self {
            service_uuid: parse_uuid(service)?,
            tx_uuid: parse_uuid(tx)?,
            rx_uuid: parse_uuid(rx)?,
        })
    }

    /// Properties of the TX characteristic.
    #[must_use]
    pub fn tx_properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::NOTIFY | CharacteristicProperties::READ
    }

    /// Properties of the RX characteristic.
    #[must_use]
    pub fn rx_properties(&self) -> CharacteristicProperties {
        CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
    }
}

/// GATT characteristic property bits, as carried in the characteristic
/// declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How a characteristic write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteType::WithResponse => write!(f, "with response"),
            WriteType::WithoutResponse => write!(f, "without response"),
        }
    }
}

/// A characteristic found during service discovery on a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveredCharacteristic {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl DiscoveredCharacteristic {
    pub fn new(service_uuid: Uuid, uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            service_uuid,
            uuid,
            properties,
        }
    }

    /// Write-without-response when the characteristic allows it.
    #[must_use]
    pub fn preferred_write_type(&self) -> WriteType {
        if self
            .properties
            .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }

    /// The CCCD value that subscribes to this characteristic, preferring
    /// notifications over indications. `None` when it supports neither.
    #[must_use]
    pub fn subscription_value(&self) -> Option<[u8; 2]> {
        if self.properties.contains(CharacteristicProperties::NOTIFY) {
            Some(ENABLE_NOTIFICATION_VALUE)
        } else if self.properties.contains(CharacteristicProperties::INDICATE) {
            Some(ENABLE_INDICATION_VALUE)
        } else {
            None
        }
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    /// Last advertised name; `None` until some advertisement carried one.
    pub name: Option<String>,
    pub rssi: i16,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub last_seen: OffsetDateTime,
}

impl DiscoveredDevice {
    pub fn new(id: DeviceId, name: Option<String>, rssi: i16) -> Self {
        Self {
            id,
            name: name.filter(|n| !n.is_empty()),
            rssi,
            last_seen: OffsetDateTime::now_utc(),
        }
    }

    /// Fold a repeated sighting into this entry.
    ///
    /// RSSI always takes the latest value; a sighting without a name keeps
    /// the name seen earlier.
    pub fn update(&mut self, name: Option<String>, rssi: i16) {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.name = Some(name);
        }
        self.rssi = rssi;
        self.last_seen = OffsetDateTime::now_utc();
    }

    /// Best-known name, or `fallback` when none was ever advertised.
    #[must_use]
    pub fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(fallback)
    }
}

/// ATT status a GATT server answers a request with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
#[repr(u8)]
pub enum AttStatus {
    Success = 0x00,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    AttributeNotFound = 0x0A,
}

impl AttStatus {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for AttStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttStatus::Success => write!(f, "success"),
            AttStatus::ReadNotPermitted => write!(f, "read not permitted"),
            AttStatus::WriteNotPermitted => write!(f, "write not permitted"),
            AttStatus::RequestNotSupported => write!(f, "request not supported"),
            AttStatus::InvalidOffset => write!(f, "invalid offset"),
            AttStatus::AttributeNotFound => write!(f, "attribute not found"),
        }
    }
}

/// A value sliced from `offset`, as served to an ATT read.
///
/// Returns `Err(AttStatus::InvalidOffset)` when `offset` lies beyond the end;
/// an offset equal to the length yields an empty slice.
pub fn read_at_offset(value: &Bytes, offset: usize) -> Result<Bytes, AttStatus> {
    if offset > value.len() {
        return Err(AttStatus::InvalidOffset);
    }
    Ok(value.slice(offset..))
}
